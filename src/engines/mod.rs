//! Recognition engine adapters.
//!
//! Five structurally different backends sit behind one capability trait:
//! on-device batch transcription, the platform's continuous streaming
//! recognizer, two cloud streaming engines and one cloud batch engine.
//! The orchestrator only ever talks to [`EngineAdapter`]; everything
//! engine-specific (wire formats, candidate re-scoring, session renewal)
//! stays inside the adapter that needs it.

pub mod azure;
pub mod deepgram;
pub mod google;
pub mod local;
pub mod stream;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::audio_toolkit::AudioLevelSource;
use crate::settings::AppSettings;

pub use azure::AzureEngine;
pub use deepgram::DeepgramEngine;
pub use google::GoogleEngine;
pub use local::{LocalEngine, LocalTranscriber};
pub use stream::{
    RecognitionAlternative, RecognitionFragment, RecognizerConfig, RecognizerErrorKind,
    RecognizerEvent, RecognizerSession, StreamEngine, StreamingRecognizerBackend,
};

/// The five recognition backends a session can run on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Platform continuous streaming recognizer with session renewal.
    Stream,
    /// On-device batch transcription of the whole capture.
    Local,
    /// Deepgram live WebSocket streaming.
    Deepgram,
    /// Azure Speech dictation WebSocket streaming.
    Azure,
    /// Google Cloud Speech-to-Text batch over HTTP.
    GoogleCloud,
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Stream
    }
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Stream => "stream",
            EngineKind::Local => "local",
            EngineKind::Deepgram => "deepgram",
            EngineKind::Azure => "azure",
            EngineKind::GoogleCloud => "google_cloud",
        }
    }

    /// Stable model identifier recorded in history entries. The on-device
    /// engine uses whatever model the settings select.
    pub fn model_id(&self, selected_model: &str) -> String {
        match self {
            EngineKind::Stream => "native-stream".to_string(),
            EngineKind::Local => selected_model.to_string(),
            EngineKind::Deepgram => "deepgram-nova-3".to_string(),
            EngineKind::Azure => "azure-speech".to_string(),
            EngineKind::GoogleCloud => "google-cloud-chirp".to_string(),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ---------- error taxonomy ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Missing credentials or backend registration. Fatal, never retried,
    /// raised before any device or connection is opened.
    MissingConfig,
    /// Microphone busy, denied or unavailable.
    Device,
    /// Network drop or a cloud session that closed abnormally.
    Transport,
}

/// Classified adapter failure. Wraps into `anyhow::Error` at the adapter
/// boundary; the orchestrator downcasts to recover the kind.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn missing_config(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::MissingConfig,
            message: message.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Device,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Transport,
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EngineErrorKind::MissingConfig => write!(f, "missing configuration: {}", self.message),
            EngineErrorKind::Device => write!(f, "audio device error: {}", self.message),
            EngineErrorKind::Transport => write!(f, "connection error: {}", self.message),
        }
    }
}

impl std::error::Error for EngineError {}

/* ---------- adapter contract ---------- */

/// How an engine detects that the speaker went quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceMode {
    /// No native signal; the orchestrator polls the level source.
    Polling,
    /// The engine emits speech start/end events the orchestrator arms a
    /// timeout from.
    Native,
    /// The engine runs its own countdown and stops itself.
    Internal,
}

/// Event stream from a running adapter to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// Current display text: everything committed so far plus the live
    /// hypothesis. Replaced by the next interim or final.
    Interim { text: String },
    /// Full transcript committed so far. Supersedes all earlier text.
    Final { text: String },
    SpeechStart,
    SpeechEnd,
    /// A batch engine started decoding its captured buffer.
    Transcribing,
    /// Remaining time before the engine's internal silence stop fires.
    SilenceCountdown { remaining_ms: u64 },
    Error(EngineError),
    /// The underlying engine finished on its own. The orchestrator runs
    /// the normal finalize path when this arrives mid-session.
    End,
}

/// Uniform capability over the five backends.
///
/// `start` validates credentials before opening any device or connection,
/// then streams [`AdapterEvent`]s into `events` until `finalize` resolves
/// the accumulated transcript. `silence_timeout` is only honored by
/// engines whose [`SilenceMode`] is `Internal`.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    async fn start(
        &self,
        language: &str,
        device: Option<&str>,
        silence_timeout: Option<Duration>,
        events: UnboundedSender<AdapterEvent>,
    ) -> Result<()>;

    /// Finish the session and return the full transcript. Idempotent and
    /// safe to call after the engine already ended on its own.
    async fn finalize(&self) -> Result<String>;

    fn silence_mode(&self) -> SilenceMode;

    /// Level readings for the capture this engine opened, when it owns one.
    fn level_source(&self) -> Option<Arc<dyn AudioLevelSource>> {
        None
    }

    /// Confidence of the last final fragment, for engines that report it.
    fn last_confidence(&self) -> Option<f64> {
        None
    }
}

impl std::fmt::Debug for dyn EngineAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EngineAdapter")
    }
}

/// Host-supplied capabilities the factory needs for the non-cloud engines.
/// The on-device transcriber and the platform recognizer live outside this
/// crate; cloud engines only need credentials from settings.
#[derive(Default, Clone)]
pub struct EngineDeps {
    pub transcriber: Option<Arc<dyn LocalTranscriber>>,
    pub recognizer: Option<Arc<dyn StreamingRecognizerBackend>>,
}

/// Build the adapter for the configured engine. This is the only place
/// that branches on engine identity.
pub fn create_adapter(settings: &AppSettings, deps: &EngineDeps) -> Result<Arc<dyn EngineAdapter>> {
    let adapter: Arc<dyn EngineAdapter> = match settings.transcription_engine {
        EngineKind::Stream => {
            let backend = deps.recognizer.clone().ok_or_else(|| {
                EngineError::missing_config("no streaming recognizer backend registered")
            })?;
            Arc::new(StreamEngine::new(backend, settings.scoring))
        }
        EngineKind::Local => {
            let transcriber = deps.transcriber.clone().ok_or_else(|| {
                EngineError::missing_config("no on-device transcriber registered")
            })?;
            Arc::new(LocalEngine::new(transcriber)?)
        }
        EngineKind::Deepgram => Arc::new(DeepgramEngine::new(settings.deepgram_api_key.clone())?),
        EngineKind::Azure => Arc::new(AzureEngine::new(
            settings.azure_speech_key.clone(),
            settings.azure_speech_region.clone(),
        )?),
        EngineKind::GoogleCloud => {
            Arc::new(GoogleEngine::new(settings.google_cloud_api_key.clone())?)
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::get_default_settings;

    #[test]
    fn test_engine_kind_serde_names() {
        assert_eq!(serde_json::to_string(&EngineKind::Stream).unwrap(), r#""stream""#);
        assert_eq!(
            serde_json::to_string(&EngineKind::GoogleCloud).unwrap(),
            r#""google_cloud""#
        );
        let back: EngineKind = serde_json::from_str(r#""deepgram""#).unwrap();
        assert_eq!(back, EngineKind::Deepgram);
    }

    #[test]
    fn test_model_id_mapping() {
        assert_eq!(EngineKind::Stream.model_id(""), "native-stream");
        assert_eq!(EngineKind::Deepgram.model_id(""), "deepgram-nova-3");
        assert_eq!(EngineKind::Azure.model_id(""), "azure-speech");
        assert_eq!(EngineKind::GoogleCloud.model_id(""), "google-cloud-chirp");
        assert_eq!(EngineKind::Local.model_id("whisper-small"), "whisper-small");
    }

    #[test]
    fn test_factory_requires_stream_backend() {
        let settings = get_default_settings();
        let err = create_adapter(&settings, &EngineDeps::default()).unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(engine_err.kind, EngineErrorKind::MissingConfig);
    }

    #[test]
    fn test_factory_requires_local_transcriber() {
        let mut settings = get_default_settings();
        settings.transcription_engine = EngineKind::Local;
        let err = create_adapter(&settings, &EngineDeps::default()).unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(engine_err.kind, EngineErrorKind::MissingConfig);
    }

    #[test]
    fn test_factory_builds_cloud_adapters_unconfigured() {
        // Credentials are checked at start, not construction, so the
        // factory itself succeeds with empty keys.
        let mut settings = get_default_settings();
        settings.transcription_engine = EngineKind::Deepgram;
        assert!(create_adapter(&settings, &EngineDeps::default()).is_ok());
        settings.transcription_engine = EngineKind::GoogleCloud;
        assert!(create_adapter(&settings, &EngineDeps::default()).is_ok());
    }

    #[test]
    fn test_engine_error_display() {
        let e = EngineError::missing_config("Deepgram API key is not set");
        assert_eq!(
            e.to_string(),
            "missing configuration: Deepgram API key is not set"
        );
        let e = EngineError::transport("socket closed");
        assert_eq!(e.to_string(), "connection error: socket closed");
    }
}
