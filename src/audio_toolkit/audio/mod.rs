// Re-export all audio components
pub mod device;
pub mod recorder;
pub mod resampler;
pub mod utils;

pub use device::{list_input_devices, resolve_input_device, CpalDeviceInfo};
pub use recorder::{AudioRecorder, TARGET_SAMPLE_RATE};
pub use resampler::FrameResampler;
pub use utils::{encode_wav_pcm16, pcm16_le_bytes, wav_header_pcm16};
