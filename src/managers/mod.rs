//! Session orchestration: the session manager that owns the one active
//! dictation at a time, the silence monitor that ends hands-free
//! sessions, and the wake-word listener that starts them.

pub mod session;
pub mod silence;
pub mod wakeword;

pub use session::{SessionManager, SessionServices, SessionTrigger};
pub use silence::{SilenceConfig, SilenceEvent, SilenceTrigger, SpeechSignal};
pub use wakeword::{WakeWordConfig, WakeWordListener};
