//! Platform streaming recognizer engine.
//!
//! The recognizer itself lives outside this crate behind
//! [`StreamingRecognizerBackend`]; this adapter turns its bounded,
//! flaky sessions into one long dictation. Platforms cap continuous
//! recognition at well under a minute, so the engine renews the
//! underlying session at quiet moments and stitches the transcript
//! across the seam, promoting any unfinished interim so no words are
//! lost. It also re-scores recognition alternatives for languages the
//! platform models like to transliterate into ASCII, and runs its own
//! silence countdown because the capture belongs to the platform.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{AdapterEvent, EngineAdapter, EngineError, SilenceMode};
use crate::language::{signal_score, special_chars, to_bcp47, ScoringWeights};

/* ---------- backend contract ---------- */

/// One recognition hypothesis with the service's confidence for it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionAlternative {
    pub text: String,
    /// 0.0 when the service reports none, which is common for interims.
    pub confidence: f64,
}

/// A burst of alternatives for one audio span. Interim fragments are
/// superseded by later fragments, final fragments commit.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionFragment {
    pub is_final: bool,
    pub alternatives: Vec<RecognitionAlternative>,
}

/// Settings for one recognizer session.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizerConfig {
    /// BCP-47 tag, e.g. "tr-TR".
    pub language: String,
    pub interim_results: bool,
    pub max_alternatives: usize,
}

/// Error classes a recognizer session can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerErrorKind {
    /// The session was aborted locally; expected during teardown.
    Aborted,
    /// The recognizer gave up waiting for speech.
    NoSpeech,
    /// Microphone permission denied.
    NotAllowed,
    /// Capture device busy or unavailable.
    AudioCapture,
    Network,
    Other(String),
}

/// Events one recognizer session pushes while it runs. `Ended` is always
/// last; a graceful [`RecognizerSession::stop`] flushes pending fragments
/// before it, [`RecognizerSession::abort`] does not.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    SpeechStart,
    SpeechEnd,
    Result(RecognitionFragment),
    Error(RecognizerErrorKind),
    Ended,
}

/// Handle onto one open recognizer session.
pub trait RecognizerSession: Send + Sync {
    /// Graceful stop: pending fragments are delivered before `Ended`.
    fn stop(&self);
    /// Immediate teardown, dropping pending fragments.
    fn abort(&self);
}

/// Host-registered platform recognizer. One backend serves both
/// dictation and the wake-word listener; every `open` is an independent
/// session with its own event channel.
#[async_trait]
pub trait StreamingRecognizerBackend: Send + Sync {
    /// Whether the platform offers a recognizer at all.
    fn is_supported(&self) -> bool {
        true
    }

    async fn open(
        &self,
        config: RecognizerConfig,
        events: UnboundedSender<RecognizerEvent>,
    ) -> Result<Box<dyn RecognizerSession>>;
}

/* ---------- renewal and retry tuning ---------- */

/// Never renew a session younger than this; give it a chance to settle.
const MIN_SESSION_AGE: Duration = Duration::from_secs(8);
/// Renew unconditionally past this age, the model context degrades.
const MAX_SESSION_AGE: Duration = Duration::from_secs(45);
/// Quiet window after a final before a renewal is considered safe.
const RESTART_QUIET_WINDOW: Duration = Duration::from_secs(2);
/// Margin added when re-evaluating a too-young session.
const RESTART_MARGIN: Duration = Duration::from_millis(100);
const MAX_ERROR_RETRIES: u32 = 3;
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(2);
/// A stop the recognizer does not acknowledge is aborted after this.
const STOP_FALLBACK: Duration = Duration::from_secs(3);
/// Cadence of the silence countdown events.
const COUNTDOWN_TICK: Duration = Duration::from_millis(500);

/* ---------- candidate selection ---------- */

/// Best final candidate: service confidence scaled up, plus the language
/// signal score, so a properly-spelled alternative can beat an ASCII
/// transliteration with marginally higher confidence.
fn pick_best_final(
    alternatives: &[RecognitionAlternative],
    chars: &[char],
    weights: &ScoringWeights,
) -> (String, f64) {
    let mut best_text = String::new();
    let mut best_conf = alternatives.first().map(|a| a.confidence).unwrap_or(0.0);
    let mut best_score = f64::NEG_INFINITY;

    for alt in alternatives {
        let score = alt.confidence * weights.confidence + signal_score(&alt.text, chars, weights);
        if score > best_score {
            best_score = score;
            best_text = alt.text.clone();
            best_conf = alt.confidence;
        }
    }
    (best_text, best_conf)
}

/// Best interim candidate, same scoring with the interim weight.
fn pick_best_interim(
    alternatives: &[RecognitionAlternative],
    chars: &[char],
    weights: &ScoringWeights,
) -> String {
    let mut best_text = alternatives.first().map(|a| a.text.clone()).unwrap_or_default();
    let mut best_score = signal_score(&best_text, chars, weights)
        + alternatives.first().map(|a| a.confidence).unwrap_or(0.0) * weights.interim_confidence;

    for alt in alternatives.iter().skip(1) {
        let score = signal_score(&alt.text, chars, weights)
            + alt.confidence * weights.interim_confidence;
        if score > best_score {
            best_score = score;
            best_text = alt.text.clone();
        }
    }
    best_text
}

/// Recognizers sometimes drop words or diacritics between the last
/// interim and the final. Prefer the tracked interim when any of these
/// hold: it has more words and a better signal score, the same words but
/// a clearly better score, or the final lost two or more words while the
/// interim still shows language-specific spelling.
fn prefer_interim(
    interim: &str,
    final_seg: &str,
    chars: &[char],
    weights: &ScoringWeights,
) -> bool {
    let interim_words = interim.split_whitespace().count();
    let final_words = final_seg.split_whitespace().count();
    let interim_score = signal_score(interim, chars, weights);
    let final_score = signal_score(final_seg, chars, weights);

    (interim_words > final_words && interim_score > final_score)
        || (interim_words == final_words && interim_score >= final_score + 2.0)
        || (final_words <= interim_words.saturating_sub(2) && interim_score > 0.0)
}

fn append_segment(transcript: &mut String, seg: &str) {
    if seg.is_empty() {
        return;
    }
    if !transcript.is_empty() && !transcript.ends_with(' ') && !seg.starts_with(' ') {
        transcript.push(' ');
    }
    transcript.push_str(seg);
}

fn display_text(committed: &str, interim: &str) -> String {
    if committed.is_empty() {
        interim.to_string()
    } else {
        format!("{} {}", committed, interim)
    }
}

/* ---------- engine ---------- */

enum PumpControl {
    Finalize { ack: oneshot::Sender<String> },
}

struct ActivePump {
    ctrl_tx: UnboundedSender<PumpControl>,
    task: JoinHandle<()>,
}

/// Continuous dictation over the platform recognizer, with session
/// renewal, interim reconciliation and an internal silence stop.
pub struct StreamEngine {
    backend: Arc<dyn StreamingRecognizerBackend>,
    weights: ScoringWeights,
    transcript: Arc<Mutex<String>>,
    confidence: Arc<Mutex<f64>>,
    active: Mutex<Option<ActivePump>>,
}

impl StreamEngine {
    pub fn new(backend: Arc<dyn StreamingRecognizerBackend>, weights: ScoringWeights) -> Self {
        Self {
            backend,
            weights,
            transcript: Arc::new(Mutex::new(String::new())),
            confidence: Arc::new(Mutex::new(1.0)),
            active: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EngineAdapter for StreamEngine {
    async fn start(
        &self,
        language: &str,
        _device: Option<&str>,
        silence_timeout: Option<Duration>,
        events: UnboundedSender<AdapterEvent>,
    ) -> Result<()> {
        if !self.backend.is_supported() {
            return Err(
                EngineError::missing_config("platform speech recognition is not available").into(),
            );
        }

        // A forgotten previous run is abandoned, never resumed.
        if let Some(previous) = self.active.lock().unwrap().take() {
            previous.task.abort();
        }

        self.transcript.lock().unwrap().clear();
        *self.confidence.lock().unwrap() = 1.0;

        let config = RecognizerConfig {
            language: to_bcp47(language),
            interim_results: true,
            max_alternatives: 10,
        };
        info!(
            "Starting stream engine ({}, silence {:?})",
            config.language, silence_timeout
        );

        let now = Instant::now();
        let mut pump = Pump {
            backend: self.backend.clone(),
            config,
            weights: self.weights,
            chars: special_chars(language),
            events,
            transcript: self.transcript.clone(),
            confidence: self.confidence.clone(),
            session: None,
            session_rx: None,
            session_opened: now,
            last_interim: String::new(),
            best_interim: String::new(),
            best_interim_words: 0,
            last_final_at: None,
            restarting: false,
            restart_timer: RestartTimer::Idle,
            retries: 0,
            retry_at: None,
            silence_timeout,
            silence_deadline: None,
            last_activity: now,
            has_speech_started: false,
            stop_ack: None,
            stop_deadline: None,
        };
        pump.open_session().await?;
        pump.reset_silence_timer();

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump.run(ctrl_rx));
        *self.active.lock().unwrap() = Some(ActivePump { ctrl_tx, task });
        Ok(())
    }

    async fn finalize(&self) -> Result<String> {
        let active = self.active.lock().unwrap().take();
        let Some(ActivePump { ctrl_tx, task }) = active else {
            return Ok(self.transcript.lock().unwrap().clone());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if ctrl_tx.send(PumpControl::Finalize { ack: ack_tx }).is_ok() {
            if let Ok(text) = ack_rx.await {
                return Ok(text);
            }
        }
        // Pump already gone; the committed transcript is still shared.
        task.abort();
        Ok(self.transcript.lock().unwrap().clone())
    }

    fn silence_mode(&self) -> SilenceMode {
        SilenceMode::Internal
    }

    fn last_confidence(&self) -> Option<f64> {
        Some(*self.confidence.lock().unwrap())
    }
}

/* ---------- session pump ---------- */

enum RestartTimer {
    Idle,
    /// Session was too young; run the decision again once old enough.
    Reevaluate(Instant),
    /// A final arrived; renew if the quiet window passes with no newer
    /// final.
    QuietWindow(Instant),
}

impl RestartTimer {
    fn deadline(&self) -> Option<Instant> {
        match self {
            RestartTimer::Idle => None,
            RestartTimer::Reevaluate(at) | RestartTimer::QuietWindow(at) => Some(*at),
        }
    }
}

struct Pump {
    backend: Arc<dyn StreamingRecognizerBackend>,
    config: RecognizerConfig,
    weights: ScoringWeights,
    chars: &'static [char],
    events: UnboundedSender<AdapterEvent>,
    transcript: Arc<Mutex<String>>,
    confidence: Arc<Mutex<f64>>,

    session: Option<Box<dyn RecognizerSession>>,
    session_rx: Option<UnboundedReceiver<RecognizerEvent>>,
    session_opened: Instant,

    last_interim: String,
    best_interim: String,
    best_interim_words: usize,
    last_final_at: Option<Instant>,

    restarting: bool,
    restart_timer: RestartTimer,
    retries: u32,
    retry_at: Option<Instant>,

    silence_timeout: Option<Duration>,
    silence_deadline: Option<Instant>,
    last_activity: Instant,
    has_speech_started: bool,

    stop_ack: Option<oneshot::Sender<String>>,
    stop_deadline: Option<Instant>,
}

async fn recv_next(rx: &mut Option<UnboundedReceiver<RecognizerEvent>>) -> Option<RecognizerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Pump {
    async fn run(mut self, mut ctrl_rx: UnboundedReceiver<PumpControl>) {
        let mut countdown = tokio::time::interval(COUNTDOWN_TICK);
        countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let countdown_on = self.silence_timeout.is_some();
            tokio::select! {
                ev = recv_next(&mut self.session_rx) => {
                    match ev {
                        Some(RecognizerEvent::Result(fragment)) => self.on_fragment(fragment),
                        Some(RecognizerEvent::SpeechStart) => self.on_speech_start(),
                        Some(RecognizerEvent::SpeechEnd) => self.on_speech_end(),
                        Some(RecognizerEvent::Error(kind)) => self.on_error(kind),
                        Some(RecognizerEvent::Ended) | None => {
                            if self.on_ended().await {
                                break;
                            }
                        }
                    }
                }
                ctrl = ctrl_rx.recv() => {
                    match ctrl {
                        Some(PumpControl::Finalize { ack }) => {
                            if self.on_finalize(ack) {
                                break;
                            }
                        }
                        None => {
                            if let Some(session) = self.session.take() {
                                session.abort();
                            }
                            break;
                        }
                    }
                }
                _ = sleep_until_opt(self.silence_deadline) => self.on_silence_timeout(),
                _ = sleep_until_opt(self.restart_timer.deadline()) => self.on_restart_timer(),
                _ = sleep_until_opt(self.retry_at) => {
                    if self.on_retry_timer().await {
                        break;
                    }
                }
                _ = sleep_until_opt(self.stop_deadline) => {
                    self.on_stop_fallback();
                    break;
                }
                _ = countdown.tick(), if countdown_on => self.on_countdown_tick(),
            }
        }
    }

    async fn open_session(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.backend.open(self.config.clone(), tx).await?;
        self.session = Some(session);
        self.session_rx = Some(rx);
        self.session_opened = Instant::now();
        self.best_interim.clear();
        self.best_interim_words = 0;
        Ok(())
    }

    fn reset_silence_timer(&mut self) {
        let Some(timeout) = self.silence_timeout else {
            return;
        };
        let now = Instant::now();
        self.last_activity = now;
        self.silence_deadline = Some(now + timeout);
    }

    fn on_speech_start(&mut self) {
        self.has_speech_started = true;
        self.reset_silence_timer();
    }

    fn on_speech_end(&mut self) {
        // Countdown baseline moves, the armed deadline does not.
        if self.has_speech_started && self.silence_timeout.is_some() {
            self.last_activity = Instant::now();
        }
    }

    fn on_fragment(&mut self, fragment: RecognitionFragment) {
        if fragment.is_final {
            let (text, conf) = pick_best_final(&fragment.alternatives, self.chars, &self.weights);
            let mut seg = text;

            if !self.best_interim.is_empty()
                && prefer_interim(&self.best_interim, &seg, self.chars, &self.weights)
            {
                debug!("Final dropped content, keeping interim: {:?}", self.best_interim);
                seg = std::mem::take(&mut self.best_interim);
            }

            let full = {
                let mut committed = self.transcript.lock().unwrap();
                append_segment(&mut committed, &seg);
                committed.clone()
            };
            *self.confidence.lock().unwrap() = conf;
            self.last_final_at = Some(Instant::now());
            self.best_interim.clear();
            self.best_interim_words = 0;
            self.last_interim.clear();

            let _ = self.events.send(AdapterEvent::Final { text: full });

            self.reset_silence_timer();
            self.schedule_smart_restart();
        } else {
            let interim = pick_best_interim(&fragment.alternatives, self.chars, &self.weights);
            if !interim.is_empty() {
                let words = interim.split_whitespace().count();
                if words >= self.best_interim_words {
                    self.best_interim = interim.clone();
                    self.best_interim_words = words;
                }
                let full = display_text(&self.transcript.lock().unwrap(), &interim);
                let _ = self.events.send(AdapterEvent::Interim { text: full });
                if interim != self.last_interim {
                    self.reset_silence_timer();
                }
            }
            self.last_interim = interim;
        }
    }

    /// Renewal decision, run after every final and on re-evaluation.
    fn schedule_smart_restart(&mut self) {
        let now = Instant::now();
        let age = now - self.session_opened;

        if age < MIN_SESSION_AGE {
            self.restart_timer =
                RestartTimer::Reevaluate(now + (MIN_SESSION_AGE - age) + RESTART_MARGIN);
            return;
        }
        if age >= MAX_SESSION_AGE {
            self.restart_timer = RestartTimer::Idle;
            self.trigger_restart();
            return;
        }
        self.restart_timer = RestartTimer::QuietWindow(now + RESTART_QUIET_WINDOW);
    }

    fn on_restart_timer(&mut self) {
        match std::mem::replace(&mut self.restart_timer, RestartTimer::Idle) {
            RestartTimer::Idle => {}
            RestartTimer::Reevaluate(_) => self.schedule_smart_restart(),
            RestartTimer::QuietWindow(_) => {
                let quiet = self
                    .last_final_at
                    .map_or(true, |at| at.elapsed() >= RESTART_QUIET_WINDOW);
                if quiet {
                    self.trigger_restart();
                }
                // Otherwise the speaker kept going; the next final
                // re-arms the window.
            }
        }
    }

    fn trigger_restart(&mut self) {
        // A pending stop always wins over renewal.
        if self.restarting || self.stop_ack.is_some() {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        debug!("Renewing recognizer session, age {:?}", self.session_opened.elapsed());
        self.restarting = true;
        session.stop();
    }

    fn on_error(&mut self, kind: RecognizerErrorKind) {
        if kind == RecognizerErrorKind::Aborted {
            return;
        }
        if self.restarting && kind == RecognizerErrorKind::NoSpeech {
            return;
        }
        warn!("Recognizer error: {:?}", kind);
        let _ = self.events.send(AdapterEvent::Error(map_error(&kind)));

        let retryable = matches!(
            kind,
            RecognizerErrorKind::Network | RecognizerErrorKind::AudioCapture
        );
        if retryable && self.retries < MAX_ERROR_RETRIES {
            self.retries += 1;
            self.retry_at = Some(Instant::now() + ERROR_RETRY_DELAY);
        }
    }

    /// Underlying session closed. Returns true when the pump should exit.
    async fn on_ended(&mut self) -> bool {
        self.session = None;
        self.session_rx = None;

        if self.restarting {
            self.restarting = false;
            self.promote_interim();
            self.best_interim.clear();
            self.best_interim_words = 0;
            match self.open_session().await {
                Ok(()) => return false,
                Err(e) => {
                    warn!("Session renewal failed: {:#}", e);
                    return self.cleanup_and_finish();
                }
            }
        }

        if self.retry_at.is_some() {
            // Died after a retryable error; keep the dictation session
            // alive until the retry timer decides.
            return false;
        }

        self.cleanup_and_finish()
    }

    /// Carries an unfinished hypothesis across a renewal so the words in
    /// flight at teardown are not lost.
    fn promote_interim(&mut self) {
        if self.last_interim.is_empty() {
            return;
        }
        let full = {
            let mut committed = self.transcript.lock().unwrap();
            append_segment(&mut committed, &self.last_interim);
            committed.clone()
        };
        self.last_interim.clear();
        let _ = self.events.send(AdapterEvent::Final { text: full });
    }

    fn on_finalize(&mut self, ack: oneshot::Sender<String>) -> bool {
        self.silence_deadline = None;
        self.restart_timer = RestartTimer::Idle;
        self.retry_at = None;
        self.restarting = false;

        match self.session.as_ref() {
            None => {
                let text = self.fallback_text();
                let _ = ack.send(text);
                true
            }
            Some(session) => {
                self.stop_ack = Some(ack);
                self.stop_deadline = Some(Instant::now() + STOP_FALLBACK);
                session.stop();
                false
            }
        }
    }

    fn on_stop_fallback(&mut self) {
        warn!("Recognizer ignored stop, aborting session");
        if let Some(session) = self.session.take() {
            session.abort();
        }
        self.session_rx = None;
        self.stop_deadline = None;
        let text = self.fallback_text();
        if let Some(ack) = self.stop_ack.take() {
            let _ = ack.send(text);
        }
    }

    fn on_silence_timeout(&mut self) {
        self.silence_deadline = None;
        info!("Silence timeout reached, stopping recognizer");
        if let Some(session) = self.session.as_ref() {
            session.stop();
        }
    }

    fn on_countdown_tick(&mut self) {
        let Some(timeout) = self.silence_timeout else {
            return;
        };
        if self.session.is_none() {
            return;
        }
        let remaining = timeout.saturating_sub(self.last_activity.elapsed());
        if !remaining.is_zero() && remaining < timeout {
            let _ = self.events.send(AdapterEvent::SilenceCountdown {
                remaining_ms: remaining.as_millis() as u64,
            });
        }
    }

    async fn on_retry_timer(&mut self) -> bool {
        self.retry_at = None;
        if self.session.is_some() || self.stop_ack.is_some() {
            return false;
        }
        info!("Reopening recognizer after transient error, attempt {}", self.retries);
        match self.open_session().await {
            Ok(()) => false,
            Err(e) => {
                warn!("Recognizer retry failed: {:#}", e);
                self.cleanup_and_finish()
            }
        }
    }

    /// Short utterances may never produce a final; fold the last interim
    /// into the transcript before reporting it.
    fn fallback_text(&self) -> String {
        let mut committed = self.transcript.lock().unwrap();
        if committed.is_empty() && !self.last_interim.is_empty() {
            *committed = self.last_interim.clone();
        }
        committed.clone()
    }

    fn cleanup_and_finish(&mut self) -> bool {
        self.silence_deadline = None;
        self.restart_timer = RestartTimer::Idle;
        self.retry_at = None;
        self.stop_deadline = None;

        let text = self.fallback_text();
        if let Some(ack) = self.stop_ack.take() {
            let _ = ack.send(text);
        }
        let _ = self.events.send(AdapterEvent::End);
        true
    }
}

fn map_error(kind: &RecognizerErrorKind) -> EngineError {
    match kind {
        RecognizerErrorKind::NotAllowed => EngineError::device("microphone permission denied"),
        RecognizerErrorKind::AudioCapture => EngineError::device("audio capture failed"),
        RecognizerErrorKind::Network => EngineError::transport("recognizer network error"),
        RecognizerErrorKind::NoSpeech => EngineError::transport("no speech detected"),
        RecognizerErrorKind::Aborted => EngineError::transport("session aborted"),
        RecognizerErrorKind::Other(message) => EngineError::transport(message.clone()),
    }
}
