use crate::engines::EngineKind;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle phase of the dictation session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Recording,
    Finishing,
}

/// Wake-word listener state, published on every transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WakeWordState {
    Inactive,
    RequestingMic,
    Starting,
    Listening,
    Hearing { transcript: String },
    Detected,
    Error { message: String },
    NoSupport,
}

/// One completed dictation, as persisted to history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: String,
    pub text: String,
    /// Raw engine output, kept only when post-processing changed it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub duration_ms: u64,
    pub engine: EngineKind,
    pub language: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Events published by the session orchestrator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseChanged { phase: SessionPhase },
    /// Partial hypothesis, replaced by later interims or a final.
    InterimTranscript { text: String },
    /// Committed text segment appended to the session transcript.
    FinalTranscript { text: String },
    /// A batch engine started decoding the captured audio.
    Transcribing,
    AudioLevel { level: f32 },
    DurationTick { seconds: u64 },
    /// Remaining time before silence auto-stop, for engines that
    /// count down internally.
    SilenceCountdown { remaining_ms: u64 },
    WakeWord(WakeWordState),
    Completed { entry: HistoryEntry },
    Error { message: String },
}

/// Why a session stopped. Logged with the finalize path; every reason
/// runs the same pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// User-requested stop.
    Manual,
    /// Silence monitor timed out.
    Silence,
    /// Maximum recording duration reached.
    MaxDuration,
    /// The engine finished on its own (internal silence stop, service
    /// closed the turn).
    EngineEnded,
    /// An external command took over the microphone.
    Takeover,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Manual => "manual",
            StopReason::Silence => "silence",
            StopReason::MaxDuration => "max_duration",
            StopReason::EngineEnded => "engine_ended",
            StopReason::Takeover => "takeover",
        }
    }
}

const BUS_CAPACITY: usize = 256;

/// Fire-and-forget broadcast channel for [`SessionEvent`]s. Emission
/// never blocks and never fails; a bus with no subscribers drops events
/// on the floor, and a slow subscriber loses the oldest events first.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: SessionEvent) {
        // Err here only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_string(&SessionEvent::InterimTranscript {
            text: "merhaba".to_string(),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"interim_transcript","data":{"text":"merhaba"}}"#
        );
    }

    #[test]
    fn test_phase_event_roundtrip() {
        let event = SessionEvent::PhaseChanged {
            phase: SessionPhase::Recording,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_wake_word_state_tagging() {
        let json = serde_json::to_string(&WakeWordState::Hearing {
            transcript: "fısıl".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"hearing","transcript":"fısıl"}"#);
    }

    #[test]
    fn test_bus_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(SessionEvent::Transcribing);
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SessionEvent::DurationTick { seconds: 3 });
        let event = rx.recv().await.unwrap();
        assert_eq!(event, SessionEvent::DurationTick { seconds: 3 });
    }

    #[test]
    fn test_history_entry_omits_empty_optionals() {
        let entry = HistoryEntry {
            id: "a".to_string(),
            text: "merhaba".to_string(),
            original_text: None,
            timestamp: 0,
            duration_ms: 1200,
            engine: EngineKind::Local,
            language: "tr".to_string(),
            model_id: "whisper-small".to_string(),
            confidence: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("original_text"));
        assert!(!json.contains("confidence"));
    }
}
