//! Speech-session orchestration: one dictation session at a time, several
//! recognition engines behind a common adapter, silence-aware hands-free
//! capture and wake-word activation.
//!
//! [`managers::SessionManager`] is the entry point; everything else is the
//! machinery it coordinates. Hosts inject their platform pieces (paster,
//! on-device transcriber, streaming recognizer) through
//! [`managers::SessionServices`] and [`engines::EngineDeps`], and observe
//! sessions through the [`events::EventBus`].

pub mod audio_toolkit;
pub mod corrections;
pub mod engines;
pub mod events;
pub mod language;
pub mod managers;
pub mod services;
pub mod settings;
pub mod text;

pub use engines::{EngineDeps, EngineKind};
pub use events::{EventBus, SessionEvent, SessionPhase, StopReason};
pub use managers::{SessionManager, SessionServices, SessionTrigger};
pub use settings::{get_default_settings, load_settings_file, AppSettings};
