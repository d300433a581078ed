//! Always-on wake-word listener.
//!
//! Runs a continuous low-cost recognition session and watches every
//! hypothesis for the configured phrase. Turkish dotted and dotless i
//! are expanded into all spelling combinations so a recognizer that
//! picks the wrong one still matches, and the default phrase carries a
//! list of near-miss spellings recognizers commonly produce for it.
//!
//! Detection never starts the dictation session directly. The listener
//! first tears down its own recognition session, then invokes the
//! activation callback once the backend reports the session closed (or
//! after a short fallback), so the microphone is free before dictation
//! claims it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time;

use crate::audio_toolkit::AudioTap;
use crate::engines::{
    RecognizerConfig, RecognizerErrorKind, RecognizerEvent, RecognizerSession,
    StreamingRecognizerBackend,
};
use crate::events::{EventBus, SessionEvent, WakeWordState};
use crate::language::{fold_lowercase, to_bcp47};

/// Delay before the first session open, so the microphone released by a
/// finishing dictation session is free again.
const START_DELAY: Duration = Duration::from_millis(50);
/// Retry delay when opening the recognition session itself fails.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Backoff after a network error before reopening.
const NETWORK_RETRY_DELAY: Duration = Duration::from_millis(1500);
/// Backoff after the capture device errored, typically because another
/// process holds it.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(2000);
/// How long to wait for the aborted session to close before firing the
/// activation callback anyway.
const DETECT_FALLBACK: Duration = Duration::from_millis(500);
/// Cap on ambiguous letter positions; expansion is 2^n variants.
const MAX_AMBIGUOUS_POSITIONS: usize = 16;

/// Spellings of the default phrase that enable the near-miss list.
const NEAR_MISS_PHRASES: &[&str] = &["fısıltı", "fisılti", "fisilti"];

/// Fragments recognizers commonly produce instead of the default
/// phrase, counted as hits when it is the configured phrase.
const NEAR_MISSES: &[&str] = &[
    "whisper", "whisp", "fısıl", "fisil", "fisilt", "fısılt", "visil", "vısıl", "visilt", "fıs",
    "fis", "wis",
];

/// Every spelling of `phrase` with dotted/dotless i swapped at each
/// ambiguous position. A phrase without ambiguous letters yields just
/// its lowercase form.
pub fn expand_variants(phrase: &str) -> Vec<String> {
    let folded = fold_lowercase(phrase.trim());
    let chars: Vec<char> = folded.chars().collect();
    let positions: Vec<usize> = chars
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == 'ı' || **c == 'i')
        .map(|(i, _)| i)
        .collect();
    if positions.is_empty() || positions.len() > MAX_AMBIGUOUS_POSITIONS {
        return vec![folded];
    }
    let mut variants = Vec::with_capacity(1 << positions.len());
    for mask in 0u32..(1u32 << positions.len()) {
        let mut candidate = chars.clone();
        for (bit, &pos) in positions.iter().enumerate() {
            candidate[pos] = if mask & (1 << bit) != 0 { 'i' } else { 'ı' };
        }
        variants.push(candidate.into_iter().collect());
    }
    variants
}

/// Configured phrase with its precomputed spelling variants.
struct PhraseMatcher {
    phrase: String,
    variants: Vec<String>,
}

impl PhraseMatcher {
    fn new(phrase: &str) -> Self {
        let phrase = fold_lowercase(phrase.trim());
        let variants = expand_variants(&phrase);
        Self { phrase, variants }
    }

    fn matches(&self, text: &str) -> bool {
        let heard = fold_lowercase(text.trim());
        if self.variants.iter().any(|v| heard.contains(v.as_str())) {
            return true;
        }
        NEAR_MISS_PHRASES.contains(&self.phrase.as_str())
            && NEAR_MISSES.iter().any(|m| heard.contains(m))
    }
}

/// What the listener needs from settings when it is armed.
#[derive(Debug, Clone)]
pub struct WakeWordConfig {
    pub language: String,
    pub phrase: String,
}

/// Invoked once per detection, after the listener released the
/// microphone.
pub type WakeCallback = Arc<dyn Fn() + Send + Sync>;

type SessionSlot = Arc<Mutex<Option<Box<dyn RecognizerSession>>>>;

/// Owns the background listening task. All state transitions are
/// published on the event bus as [`WakeWordState`].
pub struct WakeWordListener {
    backend: Arc<dyn StreamingRecognizerBackend>,
    bus: EventBus,
    probe: Arc<dyn Fn() -> Result<()> + Send + Sync>,
    matcher: Arc<Mutex<PhraseMatcher>>,
    enabled: Arc<AtomicBool>,
    /// Bumped on every enable/disable; a task whose generation no
    /// longer matches exits at its next step.
    generation: Arc<AtomicU64>,
    session_slot: SessionSlot,
}

impl WakeWordListener {
    pub fn new(backend: Arc<dyn StreamingRecognizerBackend>, bus: EventBus) -> Self {
        Self {
            backend,
            bus,
            probe: Arc::new(|| AudioTap::open(None).map(|_| ())),
            matcher: Arc::new(Mutex::new(PhraseMatcher::new(""))),
            enabled: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            session_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the microphone probe. The default opens and immediately
    /// releases a capture tap to surface permission errors up front.
    pub fn with_probe(mut self, probe: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Arms the listener. Any previous listening session is torn down
    /// first. Failures are reported as states, not errors.
    pub async fn enable(&self, config: WakeWordConfig, on_wake: WakeCallback) {
        self.disable();
        *self.matcher.lock().unwrap() = PhraseMatcher::new(&config.phrase);
        if !self.backend.is_supported() {
            warn!("Wake word unavailable: backend not supported");
            self.report(WakeWordState::NoSupport);
            return;
        }

        self.report(WakeWordState::RequestingMic);
        let probe = self.probe.clone();
        let probed = tokio::task::spawn_blocking(move || probe()).await;
        let failure = match probed {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(e) => Some(e.to_string()),
        };
        if let Some(message) = failure {
            warn!("Microphone probe failed: {message}");
            self.report(WakeWordState::Error { message });
            return;
        }

        info!("Wake word listener armed for \"{}\"", config.phrase);
        self.enabled.store(true, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = ListenerCtx {
            backend: self.backend.clone(),
            bus: self.bus.clone(),
            matcher: self.matcher.clone(),
            enabled: self.enabled.clone(),
            generation: self.generation.clone(),
            session_slot: self.session_slot.clone(),
            language: config.language,
            on_wake,
        };
        tokio::spawn(run_listener(ctx, generation));
    }

    /// Stops listening and aborts the live recognition session, if any.
    /// Idempotent.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.session_slot.lock().unwrap().take() {
            session.abort();
        }
        self.report(WakeWordState::Inactive);
    }

    /// Swaps the phrase without restarting the listening session.
    pub fn update_phrase(&self, phrase: &str) {
        info!("Wake word phrase updated to \"{phrase}\"");
        *self.matcher.lock().unwrap() = PhraseMatcher::new(phrase);
    }

    pub fn is_active(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn report(&self, state: WakeWordState) {
        self.bus.emit(SessionEvent::WakeWord(state));
    }
}

struct ListenerCtx {
    backend: Arc<dyn StreamingRecognizerBackend>,
    bus: EventBus,
    matcher: Arc<Mutex<PhraseMatcher>>,
    enabled: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    session_slot: SessionSlot,
    language: String,
    on_wake: WakeCallback,
}

impl ListenerCtx {
    fn stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn report(&self, state: WakeWordState) {
        self.bus.emit(SessionEvent::WakeWord(state));
    }

    fn abort_session(&self) {
        if let Some(session) = self.session_slot.lock().unwrap().take() {
            session.abort();
        }
    }
}

/// Open-listen-reopen loop. Exits when the generation goes stale, on a
/// terminal error, or after handing a detection off to the callback.
async fn run_listener(ctx: ListenerCtx, generation: u64) {
    let mut delay = START_DELAY;
    loop {
        time::sleep(delay).await;
        if ctx.stale(generation) {
            return;
        }

        ctx.report(WakeWordState::Starting);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let config = RecognizerConfig {
            language: to_bcp47(&ctx.language),
            interim_results: true,
            max_alternatives: 10,
        };
        let session = match ctx.backend.open(config, events_tx).await {
            Ok(session) => session,
            Err(e) => {
                if ctx.stale(generation) {
                    return;
                }
                debug!("Wake word session open failed: {e:#}");
                delay = OPEN_RETRY_DELAY;
                continue;
            }
        };
        if ctx.stale(generation) {
            session.abort();
            return;
        }
        *ctx.session_slot.lock().unwrap() = Some(session);
        ctx.report(WakeWordState::Listening);

        loop {
            let event = events_rx.recv().await;
            if ctx.stale(generation) {
                ctx.abort_session();
                return;
            }
            match event {
                Some(RecognizerEvent::Result(fragment)) => {
                    let heard = fragment
                        .alternatives
                        .first()
                        .map(|a| a.text.trim().to_string())
                        .unwrap_or_default();
                    ctx.report(WakeWordState::Hearing { transcript: heard });
                    let matched = {
                        let matcher = ctx.matcher.lock().unwrap();
                        fragment.alternatives.iter().any(|a| matcher.matches(&a.text))
                    };
                    if matched {
                        info!("Wake word detected");
                        ctx.report(WakeWordState::Detected);
                        ctx.enabled.store(false, Ordering::SeqCst);
                        ctx.abort_session();
                        drain_until_closed(&mut events_rx).await;
                        (ctx.on_wake)();
                        return;
                    }
                }
                Some(RecognizerEvent::SpeechStart) | Some(RecognizerEvent::SpeechEnd) => {}
                Some(RecognizerEvent::Error(kind)) => match kind {
                    // Abort is self-inflicted; no-speech just means a
                    // quiet room and the session end will reopen.
                    RecognizerErrorKind::Aborted | RecognizerErrorKind::NoSpeech => {}
                    RecognizerErrorKind::NotAllowed => {
                        warn!("Wake word listener lost microphone permission");
                        ctx.enabled.store(false, Ordering::SeqCst);
                        ctx.abort_session();
                        ctx.report(WakeWordState::Error {
                            message: "microphone access denied".to_string(),
                        });
                        return;
                    }
                    RecognizerErrorKind::AudioCapture => {
                        debug!("Wake word capture error, retrying");
                        ctx.abort_session();
                        ctx.report(WakeWordState::Starting);
                        delay = CAPTURE_RETRY_DELAY;
                        break;
                    }
                    RecognizerErrorKind::Network => {
                        debug!("Wake word network error, retrying");
                        ctx.abort_session();
                        ctx.report(WakeWordState::Starting);
                        delay = NETWORK_RETRY_DELAY;
                        break;
                    }
                    RecognizerErrorKind::Other(message) => {
                        warn!("Wake word listener error: {message}");
                        ctx.report(WakeWordState::Error { message });
                    }
                },
                Some(RecognizerEvent::Ended) | None => {
                    ctx.abort_session();
                    if !ctx.enabled() {
                        return;
                    }
                    delay = Duration::ZERO;
                    break;
                }
            }
        }
    }
}

/// Waits for the aborted session to report closure so the microphone is
/// released, with a fallback in case the backend never does.
async fn drain_until_closed(events_rx: &mut mpsc::UnboundedReceiver<RecognizerEvent>) {
    let fallback = time::sleep(DETECT_FALLBACK);
    tokio::pin!(fallback);
    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(RecognizerEvent::Ended) | None => return,
                Some(_) => {}
            },
            _ = &mut fallback => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::broadcast;
    use tokio::task::yield_now;
    use tokio::time::advance;

    use crate::engines::{RecognitionAlternative, RecognitionFragment};

    struct FakeSession {
        events: mpsc::UnboundedSender<RecognizerEvent>,
        aborted: Arc<AtomicBool>,
        end_on_abort: bool,
    }

    impl RecognizerSession for FakeSession {
        fn stop(&self) {
            let _ = self.events.send(RecognizerEvent::Ended);
        }

        fn abort(&self) {
            self.aborted.store(true, Ordering::SeqCst);
            if self.end_on_abort {
                let _ = self.events.send(RecognizerEvent::Ended);
            }
        }
    }

    #[derive(Clone)]
    struct FakeHandle {
        events: mpsc::UnboundedSender<RecognizerEvent>,
        aborted: Arc<AtomicBool>,
    }

    impl FakeHandle {
        fn send(&self, event: RecognizerEvent) {
            let _ = self.events.send(event);
        }

        fn heard(&self, texts: &[&str]) {
            let alternatives = texts
                .iter()
                .map(|t| RecognitionAlternative {
                    text: t.to_string(),
                    confidence: 0.9,
                })
                .collect();
            self.send(RecognizerEvent::Result(RecognitionFragment {
                is_final: false,
                alternatives,
            }));
        }

        fn was_aborted(&self) -> bool {
            self.aborted.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FakeState {
        sessions: Vec<FakeHandle>,
        fail_opens: usize,
    }

    struct FakeBackend {
        state: Mutex<FakeState>,
        supported: bool,
        end_on_abort: bool,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                state: Mutex::new(FakeState::default()),
                supported: true,
                end_on_abort: true,
            }
        }

        fn unresponsive() -> Self {
            Self {
                end_on_abort: false,
                ..Self::new()
            }
        }

        fn unsupported() -> Self {
            Self {
                supported: false,
                ..Self::new()
            }
        }

        fn failing_first(n: usize) -> Self {
            let backend = Self::new();
            backend.state.lock().unwrap().fail_opens = n;
            backend
        }

        fn open_count(&self) -> usize {
            self.state.lock().unwrap().sessions.len()
        }

        fn session(&self, index: usize) -> FakeHandle {
            self.state.lock().unwrap().sessions[index].clone()
        }
    }

    #[async_trait]
    impl StreamingRecognizerBackend for FakeBackend {
        fn is_supported(&self) -> bool {
            self.supported
        }

        async fn open(
            &self,
            _config: RecognizerConfig,
            events: mpsc::UnboundedSender<RecognizerEvent>,
        ) -> Result<Box<dyn RecognizerSession>> {
            let mut state = self.state.lock().unwrap();
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(anyhow!("open refused"));
            }
            let aborted = Arc::new(AtomicBool::new(false));
            state.sessions.push(FakeHandle {
                events: events.clone(),
                aborted: aborted.clone(),
            });
            Ok(Box::new(FakeSession {
                events,
                aborted,
                end_on_abort: self.end_on_abort,
            }))
        }
    }

    struct Harness {
        listener: WakeWordListener,
        bus_rx: broadcast::Receiver<SessionEvent>,
        detections: Arc<AtomicUsize>,
    }

    impl Harness {
        fn callback(&self) -> WakeCallback {
            let detections = self.detections.clone();
            Arc::new(move || {
                detections.fetch_add(1, Ordering::SeqCst);
            })
        }

        fn detected(&self) -> usize {
            self.detections.load(Ordering::SeqCst)
        }

        fn states(&mut self) -> Vec<WakeWordState> {
            let mut states = Vec::new();
            while let Ok(event) = self.bus_rx.try_recv() {
                if let SessionEvent::WakeWord(state) = event {
                    states.push(state);
                }
            }
            states
        }
    }

    fn harness(backend: &Arc<FakeBackend>) -> Harness {
        let bus = EventBus::new();
        let bus_rx = bus.subscribe();
        let backend: Arc<dyn StreamingRecognizerBackend> = backend.clone();
        let listener = WakeWordListener::new(backend, bus).with_probe(|| Ok(()));
        Harness {
            listener,
            bus_rx,
            detections: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn config(phrase: &str) -> WakeWordConfig {
        WakeWordConfig {
            language: "tr".to_string(),
            phrase: phrase.to_string(),
        }
    }

    async fn settle() {
        for _ in 0..16 {
            yield_now().await;
        }
    }

    async fn arm(harness: &Harness, phrase: &str) {
        let callback = harness.callback();
        harness.listener.enable(config(phrase), callback).await;
        settle().await;
        advance(START_DELAY).await;
        settle().await;
    }

    #[test]
    fn test_variant_expansion_counts() {
        let two = expand_variants("fısıl");
        assert_eq!(two.len(), 4);
        for spelling in ["fısıl", "fisıl", "fısil", "fisil"] {
            assert!(two.contains(&spelling.to_string()), "missing {spelling}");
        }

        assert_eq!(expand_variants("fısıltı").len(), 8);
        assert_eq!(expand_variants("test"), vec!["test".to_string()]);
    }

    #[test]
    fn test_variant_expansion_folds_case() {
        // Uppercase dotless I folds to ı before expansion.
        let variants = expand_variants("FISIL");
        assert_eq!(variants.len(), 4);
        assert!(variants.contains(&"fısıl".to_string()));
    }

    #[test]
    fn test_near_misses_only_for_default_phrase() {
        let default = PhraseMatcher::new("fısıltı");
        assert!(default.matches("whisper lütfen"));
        assert!(default.matches("  Visilt falan  "));
        assert!(default.matches("fisilti geldi"));

        let custom = PhraseMatcher::new("merhaba");
        assert!(custom.matches("merhaba dünya"));
        assert!(!custom.matches("whisper"));
        assert!(!custom.matches("selam"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_waits_for_session_close() {
        let backend = Arc::new(FakeBackend::unresponsive());
        let mut h = harness(&backend);
        arm(&h, "fısıltı").await;
        assert_eq!(backend.open_count(), 1);

        let states = h.states();
        assert!(states.contains(&WakeWordState::Listening), "got {states:?}");

        let session = backend.session(0);
        session.heard(&["selam", "fisilti"]);
        settle().await;

        assert!(session.was_aborted());
        assert_eq!(h.detected(), 0, "callback must wait for session close");
        let states = h.states();
        assert!(states.contains(&WakeWordState::Detected));
        assert!(!h.listener.is_active());

        session.send(RecognizerEvent::Ended);
        settle().await;
        assert_eq!(h.detected(), 1);

        // Listener stays down after a detection.
        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(backend.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_fallback_fires_without_close() {
        let backend = Arc::new(FakeBackend::unresponsive());
        let h = harness(&backend);
        arm(&h, "fısıltı").await;

        backend.session(0).heard(&["fısıltı"]);
        settle().await;
        assert_eq!(h.detected(), 0);

        advance(DETECT_FALLBACK - Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(h.detected(), 0);

        advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(h.detected(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hearing_state_carries_transcript() {
        let backend = Arc::new(FakeBackend::new());
        let mut h = harness(&backend);
        arm(&h, "fısıltı").await;

        backend.session(0).heard(&["  selam dünya  "]);
        settle().await;

        let states = h.states();
        assert!(
            states.contains(&WakeWordState::Hearing {
                transcript: "selam dünya".to_string()
            }),
            "got {states:?}"
        );
        assert_eq!(h.detected(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_backs_off_before_reopen() {
        let backend = Arc::new(FakeBackend::new());
        let h = harness(&backend);
        arm(&h, "fısıltı").await;
        assert_eq!(backend.open_count(), 1);

        backend
            .session(0)
            .send(RecognizerEvent::Error(RecognizerErrorKind::Network));
        settle().await;
        assert_eq!(backend.open_count(), 1);

        advance(NETWORK_RETRY_DELAY - Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(backend.open_count(), 1, "reopened before the backoff");

        advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(backend.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_error_uses_longer_backoff() {
        let backend = Arc::new(FakeBackend::new());
        let h = harness(&backend);
        arm(&h, "fısıltı").await;

        backend
            .session(0)
            .send(RecognizerEvent::Error(RecognizerErrorKind::AudioCapture));
        settle().await;

        advance(CAPTURE_RETRY_DELAY - Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(backend.open_count(), 1);

        advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(backend.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_error_is_terminal() {
        let backend = Arc::new(FakeBackend::new());
        let mut h = harness(&backend);
        arm(&h, "fısıltı").await;

        backend
            .session(0)
            .send(RecognizerEvent::Error(RecognizerErrorKind::NotAllowed));
        settle().await;

        assert!(!h.listener.is_active());
        let states = h.states();
        assert!(states
            .iter()
            .any(|s| matches!(s, WakeWordState::Error { .. })));

        advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(backend.open_count(), 1, "terminal error must not reopen");
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_end_reopens_immediately() {
        let backend = Arc::new(FakeBackend::new());
        let h = harness(&backend);
        arm(&h, "fısıltı").await;

        backend.session(0).send(RecognizerEvent::Ended);
        settle().await;
        assert_eq!(backend.open_count(), 2);
        assert!(h.listener.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_retries_quickly() {
        let backend = Arc::new(FakeBackend::failing_first(1));
        let h = harness(&backend);
        arm(&h, "fısıltı").await;
        assert_eq!(backend.open_count(), 0);

        advance(OPEN_RETRY_DELAY).await;
        settle().await;
        assert_eq!(backend.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_aborts_and_ignores_stale_events() {
        let backend = Arc::new(FakeBackend::unresponsive());
        let mut h = harness(&backend);
        arm(&h, "fısıltı").await;
        let session = backend.session(0);

        h.listener.disable();
        assert!(session.was_aborted());
        assert!(!h.listener.is_active());
        let states = h.states();
        assert_eq!(states.last(), Some(&WakeWordState::Inactive));

        // Events from the dead session must neither report nor detect.
        session.heard(&["fısıltı"]);
        session.send(RecognizerEvent::Ended);
        settle().await;
        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(h.detected(), 0);
        assert_eq!(backend.open_count(), 1);
        assert!(h.states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_phrase_applies_without_restart() {
        let backend = Arc::new(FakeBackend::unresponsive());
        let h = harness(&backend);
        arm(&h, "fısıltı").await;

        h.listener.update_phrase("merhaba");
        backend.session(0).heard(&["whisper"]);
        settle().await;
        assert_eq!(h.detected(), 0, "old phrase must no longer match");

        backend.session(0).heard(&["merhaba dünya"]);
        settle().await;
        advance(DETECT_FALLBACK).await;
        settle().await;
        assert_eq!(h.detected(), 1);
        assert_eq!(backend.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_backend_reports_no_support() {
        let backend = Arc::new(FakeBackend::unsupported());
        let mut h = harness(&backend);
        let callback = h.callback();
        h.listener.enable(config("fısıltı"), callback).await;
        settle().await;

        assert!(!h.listener.is_active());
        let states = h.states();
        assert_eq!(states.last(), Some(&WakeWordState::NoSupport));
        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reports_error() {
        let backend = Arc::new(FakeBackend::new());
        let bus = EventBus::new();
        let mut bus_rx = bus.subscribe();
        let listener = {
            let backend: Arc<dyn StreamingRecognizerBackend> = backend.clone();
            WakeWordListener::new(backend, bus).with_probe(|| Err(anyhow!("device busy")))
        };

        listener.enable(config("fısıltı"), Arc::new(|| {})).await;
        settle().await;

        assert!(!listener.is_active());
        let mut saw_error = false;
        while let Ok(event) = bus_rx.try_recv() {
            if let SessionEvent::WakeWord(WakeWordState::Error { message }) = event {
                assert!(message.contains("device busy"));
                saw_error = true;
            }
        }
        assert!(saw_error);
        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interim_results_are_matched() {
        // Detection must not wait for a final result.
        let backend = Arc::new(FakeBackend::new());
        let h = harness(&backend);
        arm(&h, "kayıt").await;

        backend.session(0).heard(&["kayit başlat"]);
        settle().await;
        advance(DETECT_FALLBACK).await;
        settle().await;
        assert_eq!(h.detected(), 1);
    }
}
