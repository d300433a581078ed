//! Silence and activity monitoring for hands-free sessions.
//!
//! Two implementations drive the same trigger contract. Batch engines
//! have no recognition feedback, so a polling monitor samples the audio
//! level and decides from thresholds alone. Streaming engines report
//! speech start/end natively, so an event-driven monitor just arms a
//! timeout from those signals.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::audio_toolkit::AudioLevelSource;
use crate::settings::AppSettings;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Leading silence right after activation must not stop the session.
const MIN_SPEECH_BEFORE_STOP: Duration = Duration::from_millis(1500);
/// A session in which nothing is ever said is a false start.
const NO_SPEECH_TIMEOUT: Duration = Duration::from_secs(10);

/// Thresholds for the polling monitor, derived from the sensitivity
/// setting. `speech_threshold` decides whether speech has happened at
/// all; the higher `silence_floor` decides what resets the silence
/// timer, so background hiss between the two cannot keep a dead session
/// alive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceConfig {
    pub speech_threshold: f32,
    pub silence_floor: f32,
    pub timeout: Duration,
}

impl SilenceConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        let vad = if settings.vad_threshold > 0.0 {
            settings.vad_threshold
        } else {
            0.3
        };
        let speech_threshold = (vad * 0.025).max(0.003);
        Self {
            speech_threshold,
            silence_floor: speech_threshold.max(0.006),
            timeout: Duration::from_millis(settings.silence_timeout_ms()),
        }
    }
}

/// Why the monitor decided the session should end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceEvent {
    /// Speech was heard, then sustained quiet past the timeout.
    Silence,
    /// Nothing was said within the absolute no-speech window.
    NoSpeech,
}

/// Speech activity relayed from a streaming adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechSignal {
    Started,
    Ended,
}

/// A running monitor task. Fires at most one [`SilenceEvent`], then
/// exits; a stopped or dropped trigger never fires.
pub struct SilenceTrigger {
    task: JoinHandle<()>,
}

impl SilenceTrigger {
    /// Poll the level source on a fixed cadence and trigger from
    /// thresholds. Used by engines with no native speech signals.
    pub fn spawn_polling(
        config: SilenceConfig,
        source: Arc<dyn AudioLevelSource>,
        events: UnboundedSender<SilenceEvent>,
    ) -> Self {
        let task = tokio::spawn(run_polling(config, source, events));
        Self { task }
    }

    /// Arm a timeout from the adapter's own speech start/end signals.
    pub fn spawn_event_driven(
        config: SilenceConfig,
        signals: UnboundedReceiver<SpeechSignal>,
        events: UnboundedSender<SilenceEvent>,
    ) -> Self {
        let task = tokio::spawn(run_event_driven(config, signals, events));
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SilenceTrigger {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_polling(
    config: SilenceConfig,
    source: Arc<dyn AudioLevelSource>,
    events: UnboundedSender<SilenceEvent>,
) {
    let started = Instant::now();
    let mut has_detected_speech = false;
    let mut silence_since: Option<Instant> = None;

    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let level = source.level();

        if level >= config.speech_threshold {
            has_detected_speech = true;
        }
        if level >= config.silence_floor {
            silence_since = None;
        } else if has_detected_speech {
            let since = *silence_since.get_or_insert_with(Instant::now);
            if started.elapsed() > MIN_SPEECH_BEFORE_STOP && since.elapsed() >= config.timeout {
                info!("Silence timeout after speech, ending session");
                let _ = events.send(SilenceEvent::Silence);
                return;
            }
        } else if started.elapsed() > NO_SPEECH_TIMEOUT {
            info!("No speech detected, ending session");
            let _ = events.send(SilenceEvent::NoSpeech);
            return;
        }
    }
}

async fn run_event_driven(
    config: SilenceConfig,
    mut signals: UnboundedReceiver<SpeechSignal>,
    events: UnboundedSender<SilenceEvent>,
) {
    let mut heard_speech = false;
    let mut deadline = Some(Instant::now() + NO_SPEECH_TIMEOUT);

    loop {
        tokio::select! {
            signal = signals.recv() => {
                match signal {
                    Some(SpeechSignal::Started) => {
                        heard_speech = true;
                        deadline = None;
                    }
                    Some(SpeechSignal::Ended) => {
                        deadline = Some(Instant::now() + config.timeout);
                    }
                    None => return,
                }
            }
            _ = sleep_until_opt(deadline) => {
                let event = if heard_speech {
                    info!("Silence timeout after speech, ending session");
                    SilenceEvent::Silence
                } else {
                    info!("No speech detected, ending session");
                    SilenceEvent::NoSpeech
                };
                let _ = events.send(event);
                return;
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
