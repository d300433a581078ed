pub mod audio;
pub mod level;

pub use audio::{
    encode_wav_pcm16, list_input_devices, pcm16_le_bytes, wav_header_pcm16, AudioRecorder,
    CpalDeviceInfo, FrameResampler, TARGET_SAMPLE_RATE,
};
pub use level::{AudioLevelSource, AudioTap, SharedLevel, SpectralAnalyzer};
