//! Session orchestrator.
//!
//! Owns the single active dictation session. A start claims the slot
//! synchronously before any backend setup, so a stop issued right after
//! always observes the session; every stop path (manual, silence, max
//! duration, engine end, takeover) runs the same finalize pipeline:
//! post-process, record history and usage, publish, paste. Late events
//! from a torn-down session are discarded by generation checks rather
//! than by racing teardown order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::engines::{
    self, AdapterEvent, EngineAdapter, EngineDeps, EngineError, EngineKind, RecognizerConfig,
    RecognizerEvent, RecognizerSession, SilenceMode, StreamingRecognizerBackend,
};
use crate::events::{EventBus, HistoryEntry, SessionEvent, SessionPhase, StopReason};
use crate::managers::silence::{SilenceConfig, SilenceEvent, SilenceTrigger, SpeechSignal};
use crate::managers::wakeword::{WakeCallback, WakeWordConfig, WakeWordListener};
use crate::services::{HistoryStore, NullPaster, Paster, SettingsProvider, TextProcessing, UsageLedger};
use crate::settings::AppSettings;

/// Grace delay between a session ending and the wake-word listener
/// reopening the microphone.
const WAKE_REARM_DELAY: Duration = Duration::from_millis(500);
/// Cadence of elapsed-time events while recording.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Cadence of audio level events when the engine exposes a level source.
const LEVEL_INTERVAL: Duration = Duration::from_millis(100);

/// What asked for the session. Hands-free sessions get a silence
/// monitor; push-to-talk sessions end only on explicit stop or the
/// duration cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTrigger {
    Manual,
    WakeWord,
}

/// Builds the adapter for a session. Swappable so hosts can inject
/// their own engines.
pub type AdapterFactory =
    Box<dyn Fn(&AppSettings, &EngineDeps) -> Result<Arc<dyn EngineAdapter>> + Send + Sync>;

/// Host-supplied collaborators. Every field has a headless default.
pub struct SessionServices {
    pub paster: Arc<dyn Paster>,
    pub processor: Option<Arc<dyn TextProcessing>>,
    pub history: HistoryStore,
    pub usage: UsageLedger,
    pub adapter_factory: Option<AdapterFactory>,
    /// Microphone probe for the wake-word listener.
    pub mic_probe: Option<Box<dyn Fn() -> Result<()> + Send + Sync>>,
}

impl Default for SessionServices {
    fn default() -> Self {
        Self {
            paster: Arc::new(NullPaster),
            processor: None,
            history: HistoryStore::in_memory(),
            usage: UsageLedger::default(),
            adapter_factory: None,
            mic_probe: None,
        }
    }
}

struct ActiveSession {
    adapter: Arc<dyn EngineAdapter>,
    engine: EngineKind,
    language: String,
    model_id: String,
    started_at: Instant,
    silence: Option<SilenceTrigger>,
    tasks: Vec<JoinHandle<()>>,
}

struct OrchestratorState {
    /// Bumped once per started session; stale monitors compare against
    /// it and drop out.
    generation: u64,
    session: Option<ActiveSession>,
}

struct SessionInner {
    settings: Arc<dyn SettingsProvider>,
    deps: EngineDeps,
    bus: EventBus,
    factory: AdapterFactory,
    paster: Arc<dyn Paster>,
    processor: Option<Arc<dyn TextProcessing>>,
    history: Arc<Mutex<HistoryStore>>,
    usage: Arc<Mutex<UsageLedger>>,
    listener: WakeWordListener,
    state: Mutex<OrchestratorState>,
}

/// Public handle. Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        deps: EngineDeps,
        services: SessionServices,
        bus: EventBus,
    ) -> Self {
        let backend: Arc<dyn StreamingRecognizerBackend> = deps
            .recognizer
            .clone()
            .unwrap_or_else(|| Arc::new(NoRecognizer));
        let mut listener = WakeWordListener::new(backend, bus.clone());
        if let Some(probe) = services.mic_probe {
            listener = listener.with_probe(probe);
        }
        let factory = services
            .adapter_factory
            .unwrap_or_else(|| Box::new(|settings, deps| engines::create_adapter(settings, deps)));
        Self {
            inner: Arc::new(SessionInner {
                settings,
                deps,
                bus,
                factory,
                paster: services.paster,
                processor: services.processor,
                history: Arc::new(Mutex::new(services.history)),
                usage: Arc::new(Mutex::new(services.usage)),
                listener,
                state: Mutex::new(OrchestratorState {
                    generation: 0,
                    session: None,
                }),
            }),
        }
    }

    /// Starts a session. No-op when one is already active.
    pub async fn start(&self, trigger: SessionTrigger) {
        SessionInner::start_session(self.inner.clone(), trigger).await;
    }

    /// Finalizes the active session. No-op when none is active.
    pub async fn stop(&self) {
        self.stop_with(StopReason::Manual).await;
    }

    /// Same finalize path as [`stop`](Self::stop), for internally or
    /// externally forced teardown.
    pub async fn force_stop(&self, reason: StopReason) {
        self.stop_with(reason).await;
    }

    async fn stop_with(&self, reason: StopReason) {
        let generation = {
            let state = self.inner.state.lock().unwrap();
            if state.session.is_none() {
                debug!("Stop ignored: no active session");
                return;
            }
            state.generation
        };
        SessionInner::finish(self.inner.clone(), generation, reason).await;
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().session.is_some()
    }

    /// Arms the wake-word listener with the configured phrase.
    pub async fn enable_wake_word(&self) {
        let settings = self.inner.settings.current();
        let config = WakeWordConfig {
            language: settings.language.clone(),
            phrase: settings.wake_word.clone(),
        };
        let callback = SessionInner::wake_callback(&self.inner);
        self.inner.listener.enable(config, callback).await;
    }

    pub fn disable_wake_word(&self) {
        self.inner.listener.disable();
    }

    /// Applies a new phrase to the running listener without restarting
    /// it.
    pub fn update_wake_word(&self, phrase: &str) {
        self.inner.listener.update_phrase(phrase);
    }

    pub fn is_wake_word_active(&self) -> bool {
        self.inner.listener.is_active()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.bus.subscribe()
    }

    pub fn history(&self) -> Arc<Mutex<HistoryStore>> {
        self.inner.history.clone()
    }

    pub fn usage(&self) -> Arc<Mutex<UsageLedger>> {
        self.inner.usage.clone()
    }
}

impl SessionInner {
    /// True while `generation` still names the live session. Everything
    /// asynchronous checks this before touching shared state.
    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock().unwrap();
        state.generation == generation && state.session.is_some()
    }

    fn wake_callback(inner: &Arc<SessionInner>) -> WakeCallback {
        let weak = Arc::downgrade(inner);
        Arc::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                SessionInner::start_session(inner, SessionTrigger::WakeWord).await;
            });
        })
    }

    async fn start_session(inner: Arc<SessionInner>, trigger: SessionTrigger) {
        if inner.state.lock().unwrap().session.is_some() {
            debug!("Start ignored: a session is already active");
            return;
        }
        let settings = inner.settings.current();
        let adapter = match (inner.factory)(&settings, &inner.deps) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Engine setup failed: {e:#}");
                inner.bus.emit(SessionEvent::Error {
                    message: format!("{e:#}"),
                });
                Self::rearm_wake_word(&inner);
                return;
            }
        };

        let generation = {
            let mut state = inner.state.lock().unwrap();
            if state.session.is_some() {
                debug!("Start ignored: a session is already active");
                return;
            }
            state.generation += 1;
            state.session = Some(ActiveSession {
                adapter: adapter.clone(),
                engine: settings.transcription_engine,
                language: settings.language.clone(),
                model_id: settings
                    .transcription_engine
                    .model_id(&settings.selected_model),
                started_at: Instant::now(),
                silence: None,
                tasks: Vec::new(),
            });
            state.generation
        };
        info!(
            "Starting {} session ({:?})",
            settings.transcription_engine, trigger
        );
        inner.bus.emit(SessionEvent::PhaseChanged {
            phase: SessionPhase::Recording,
        });
        // One capture at a time: the listener must let go of the
        // microphone before the engine opens it.
        inner.listener.disable();

        let mode = adapter.silence_mode();
        let silence_timeout = if trigger == SessionTrigger::WakeWord && mode == SilenceMode::Internal
        {
            Some(Duration::from_millis(settings.silence_timeout_ms()))
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = adapter
            .start(
                &settings.language,
                settings.selected_microphone.as_deref(),
                silence_timeout,
                events_tx,
            )
            .await
        {
            warn!("Engine start failed: {e:#}");
            {
                let mut state = inner.state.lock().unwrap();
                if state.generation == generation {
                    state.session = None;
                }
            }
            inner.bus.emit(SessionEvent::Error {
                message: format!("{e:#}"),
            });
            inner.bus.emit(SessionEvent::PhaseChanged {
                phase: SessionPhase::Idle,
            });
            Self::rearm_wake_word(&inner);
            return;
        }

        let mut silence = None;
        let mut speech_tx = None;
        let mut tasks = Vec::new();
        if trigger == SessionTrigger::WakeWord {
            match mode {
                SilenceMode::Polling => {
                    if let Some(source) = adapter.level_source() {
                        let (silence_events_tx, silence_events_rx) = mpsc::unbounded_channel();
                        silence = Some(SilenceTrigger::spawn_polling(
                            SilenceConfig::from_settings(&settings),
                            source,
                            silence_events_tx,
                        ));
                        tasks.push(tokio::spawn(Self::watch_silence(
                            inner.clone(),
                            generation,
                            silence_events_rx,
                        )));
                    }
                }
                SilenceMode::Native => {
                    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
                    let (silence_events_tx, silence_events_rx) = mpsc::unbounded_channel();
                    silence = Some(SilenceTrigger::spawn_event_driven(
                        SilenceConfig::from_settings(&settings),
                        signal_rx,
                        silence_events_tx,
                    ));
                    tasks.push(tokio::spawn(Self::watch_silence(
                        inner.clone(),
                        generation,
                        silence_events_rx,
                    )));
                    speech_tx = Some(signal_tx);
                }
                // The engine times itself out and reports End.
                SilenceMode::Internal => {}
            }
        }
        if let Some(source) = adapter.level_source() {
            tasks.push(tokio::spawn(Self::pump_levels(
                inner.clone(),
                generation,
                source,
            )));
        }
        tasks.push(tokio::spawn(Self::pump_events(
            inner.clone(),
            generation,
            events_rx,
            speech_tx,
        )));
        tasks.push(tokio::spawn(Self::run_ticker(inner.clone(), generation)));
        let max_duration = settings.max_record_duration_ms();
        if max_duration > 0 {
            tasks.push(tokio::spawn(Self::watch_max_duration(
                inner.clone(),
                generation,
                Duration::from_millis(max_duration),
            )));
        }

        let attached = {
            let mut state = inner.state.lock().unwrap();
            let current = state.generation == generation;
            match state.session.as_mut() {
                Some(session) if current => {
                    session.silence = silence.take();
                    session.tasks.append(&mut tasks);
                    true
                }
                _ => false,
            }
        };
        if !attached {
            // A stop won the race while the engine was opening.
            debug!("Session torn down during engine start");
            for task in &tasks {
                task.abort();
            }
            if let Some(silence) = silence {
                silence.stop();
            }
            let _ = adapter.finalize().await;
        }
    }

    /// The one finalize path. Takes the session out of the slot first,
    /// so every later event and timer sees a stale generation.
    async fn finish(inner: Arc<SessionInner>, generation: u64, reason: StopReason) {
        let session = {
            let mut state = inner.state.lock().unwrap();
            if state.generation != generation {
                return;
            }
            match state.session.take() {
                Some(session) => session,
                None => return,
            }
        };
        info!("Stopping session ({})", reason.as_str());
        for task in &session.tasks {
            task.abort();
        }
        if let Some(silence) = &session.silence {
            silence.stop();
        }
        inner.bus.emit(SessionEvent::PhaseChanged {
            phase: SessionPhase::Finishing,
        });
        // Batch engines decode the whole capture now; let the shell say
        // so instead of looking frozen.
        if session.adapter.silence_mode() == SilenceMode::Polling {
            inner.bus.emit(SessionEvent::Transcribing);
        }
        let raw = match session.adapter.finalize().await {
            Ok(text) => text,
            Err(e) => {
                warn!("Finalize failed: {e:#}");
                inner.bus.emit(SessionEvent::Error {
                    message: format!("{e:#}"),
                });
                String::new()
            }
        };
        let duration_ms = session.started_at.elapsed().as_millis() as u64;
        Self::finish_with_text(&inner, &session, &raw, duration_ms).await;
        inner.bus.emit(SessionEvent::PhaseChanged {
            phase: SessionPhase::Idle,
        });
        Self::rearm_wake_word(&inner);
    }

    /// Post-process, record and deliver. An empty transcript produces
    /// no history entry and no paste.
    async fn finish_with_text(
        inner: &Arc<SessionInner>,
        session: &ActiveSession,
        raw: &str,
        duration_ms: u64,
    ) {
        let raw = raw.trim();
        if raw.is_empty() {
            debug!("Session ended without text");
            return;
        }
        let processed = match &inner.processor {
            Some(processor) => match processor.process(raw).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Post-processing failed, keeping raw text: {e:#}");
                    raw.to_string()
                }
            },
            None => raw.to_string(),
        };
        let original_text = (processed != raw).then(|| raw.to_string());

        if matches!(
            session.engine,
            EngineKind::Deepgram | EngineKind::Azure | EngineKind::GoogleCloud
        ) {
            inner.usage.lock().unwrap().record(session.engine, duration_ms);
        }

        let entry = HistoryEntry {
            id: Uuid::new_v4().to_string(),
            text: processed.clone(),
            original_text,
            timestamp: chrono::Utc::now().timestamp_millis(),
            duration_ms,
            engine: session.engine,
            language: session.language.clone(),
            model_id: session.model_id.clone(),
            confidence: session.adapter.last_confidence(),
        };
        inner.history.lock().unwrap().add(entry.clone());
        info!(
            "Session finished: {} chars in {} ms ({})",
            entry.text.chars().count(),
            duration_ms,
            entry.model_id
        );
        inner.bus.emit(SessionEvent::Completed { entry });

        if inner.settings.current().auto_paste {
            if let Err(e) = inner.paster.paste(&processed) {
                warn!("Paste failed: {e:#}");
            }
        }
    }

    /// Re-arms the listener after the grace delay, unless the feature is
    /// off or another session claimed the microphone meanwhile.
    fn rearm_wake_word(inner: &Arc<SessionInner>) {
        let inner = inner.clone();
        tokio::spawn(async move {
            time::sleep(WAKE_REARM_DELAY).await;
            let settings = inner.settings.current();
            if !settings.voice_activation {
                return;
            }
            if inner.state.lock().unwrap().session.is_some() {
                return;
            }
            let config = WakeWordConfig {
                language: settings.language.clone(),
                phrase: settings.wake_word.clone(),
            };
            let callback = SessionInner::wake_callback(&inner);
            inner.listener.enable(config, callback).await;
        });
    }

    async fn pump_events(
        inner: Arc<SessionInner>,
        generation: u64,
        mut events: UnboundedReceiver<AdapterEvent>,
        speech_tx: Option<UnboundedSender<SpeechSignal>>,
    ) {
        while let Some(event) = events.recv().await {
            if !inner.is_current(generation) {
                return;
            }
            match event {
                AdapterEvent::Interim { text } => {
                    inner.bus.emit(SessionEvent::InterimTranscript { text });
                }
                AdapterEvent::Final { text } => {
                    inner.bus.emit(SessionEvent::FinalTranscript { text });
                }
                AdapterEvent::SpeechStart => {
                    if let Some(tx) = &speech_tx {
                        let _ = tx.send(SpeechSignal::Started);
                    }
                }
                AdapterEvent::SpeechEnd => {
                    if let Some(tx) = &speech_tx {
                        let _ = tx.send(SpeechSignal::Ended);
                    }
                }
                AdapterEvent::Transcribing => {
                    inner.bus.emit(SessionEvent::Transcribing);
                }
                AdapterEvent::SilenceCountdown { remaining_ms } => {
                    inner
                        .bus
                        .emit(SessionEvent::SilenceCountdown { remaining_ms });
                }
                AdapterEvent::Error(e) => {
                    warn!("Engine error: {e}");
                    inner.bus.emit(SessionEvent::Error {
                        message: e.to_string(),
                    });
                }
                AdapterEvent::End => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        SessionInner::finish(inner, generation, StopReason::EngineEnded).await;
                    });
                    return;
                }
            }
        }
    }

    async fn watch_silence(
        inner: Arc<SessionInner>,
        generation: u64,
        mut events: UnboundedReceiver<SilenceEvent>,
    ) {
        if let Some(event) = events.recv().await {
            if !inner.is_current(generation) {
                return;
            }
            match event {
                SilenceEvent::Silence => info!("Silence timeout reached"),
                SilenceEvent::NoSpeech => info!("No speech detected, treating as false start"),
            }
            tokio::spawn(async move {
                SessionInner::finish(inner, generation, StopReason::Silence).await;
            });
        }
    }

    async fn watch_max_duration(inner: Arc<SessionInner>, generation: u64, limit: Duration) {
        time::sleep(limit).await;
        if !inner.is_current(generation) {
            return;
        }
        info!("Maximum recording duration reached");
        tokio::spawn(async move {
            SessionInner::finish(inner, generation, StopReason::MaxDuration).await;
        });
    }

    async fn run_ticker(inner: Arc<SessionInner>, generation: u64) {
        let started = Instant::now();
        let mut interval = time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            if !inner.is_current(generation) {
                return;
            }
            inner.bus.emit(SessionEvent::DurationTick {
                seconds: started.elapsed().as_secs(),
            });
        }
    }

    async fn pump_levels(
        inner: Arc<SessionInner>,
        generation: u64,
        source: Arc<dyn crate::audio_toolkit::AudioLevelSource>,
    ) {
        let mut interval = time::interval(LEVEL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if !inner.is_current(generation) {
                return;
            }
            inner.bus.emit(SessionEvent::AudioLevel {
                level: source.level(),
            });
        }
    }
}

/// Stand-in backend when the host registers no streaming recognizer;
/// makes the wake-word listener report no-support instead of failing.
struct NoRecognizer;

#[async_trait]
impl StreamingRecognizerBackend for NoRecognizer {
    fn is_supported(&self) -> bool {
        false
    }

    async fn open(
        &self,
        _config: RecognizerConfig,
        _events: UnboundedSender<RecognizerEvent>,
    ) -> Result<Box<dyn RecognizerSession>> {
        Err(EngineError::missing_config("no streaming recognizer backend registered").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::task::yield_now;
    use tokio::time::advance;

    use crate::audio_toolkit::AudioLevelSource;
    use crate::engines::{RecognitionAlternative, RecognitionFragment};
    use crate::events::WakeWordState;
    use crate::services::MemorySettings;
    use crate::settings::get_default_settings;

    /* ---------- doubles ---------- */

    struct FakeLevels(Mutex<f32>);

    impl FakeLevels {
        fn new(level: f32) -> Arc<Self> {
            Arc::new(Self(Mutex::new(level)))
        }

        fn set(&self, level: f32) {
            *self.0.lock().unwrap() = level;
        }
    }

    impl AudioLevelSource for FakeLevels {
        fn level(&self) -> f32 {
            *self.0.lock().unwrap()
        }
    }

    struct FakeAdapter {
        mode: SilenceMode,
        transcript: Mutex<String>,
        starts: AtomicUsize,
        finalizes: AtomicUsize,
        fail_start: Mutex<Option<anyhow::Error>>,
        start_delay: Option<Duration>,
        events: Mutex<Option<UnboundedSender<AdapterEvent>>>,
        captured_timeout: Mutex<Option<Duration>>,
        levels: Option<Arc<FakeLevels>>,
        confidence: Option<f64>,
    }

    impl FakeAdapter {
        fn new(mode: SilenceMode) -> Self {
            Self {
                mode,
                transcript: Mutex::new(String::new()),
                starts: AtomicUsize::new(0),
                finalizes: AtomicUsize::new(0),
                fail_start: Mutex::new(None),
                start_delay: None,
                events: Mutex::new(None),
                captured_timeout: Mutex::new(None),
                levels: None,
                confidence: None,
            }
        }

        fn set_transcript(&self, text: &str) {
            *self.transcript.lock().unwrap() = text.to_string();
        }

        fn send(&self, event: AdapterEvent) {
            if let Some(tx) = &*self.events.lock().unwrap() {
                let _ = tx.send(event);
            }
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        fn finalizes(&self) -> usize {
            self.finalizes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EngineAdapter for FakeAdapter {
        async fn start(
            &self,
            _language: &str,
            _device: Option<&str>,
            silence_timeout: Option<Duration>,
            events: UnboundedSender<AdapterEvent>,
        ) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.captured_timeout.lock().unwrap() = silence_timeout;
            if let Some(delay) = self.start_delay {
                time::sleep(delay).await;
            }
            if let Some(e) = self.fail_start.lock().unwrap().take() {
                return Err(e);
            }
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn finalize(&self) -> Result<String> {
            self.finalizes.fetch_add(1, Ordering::SeqCst);
            Ok(self.transcript.lock().unwrap().clone())
        }

        fn silence_mode(&self) -> SilenceMode {
            self.mode
        }

        fn level_source(&self) -> Option<Arc<dyn AudioLevelSource>> {
            self.levels
                .clone()
                .map(|levels| levels as Arc<dyn AudioLevelSource>)
        }

        fn last_confidence(&self) -> Option<f64> {
            self.confidence
        }
    }

    struct RecordingPaster {
        pasted: Mutex<Vec<String>>,
    }

    impl RecordingPaster {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pasted: Mutex::new(Vec::new()),
            })
        }

        fn texts(&self) -> Vec<String> {
            self.pasted.lock().unwrap().clone()
        }
    }

    impl Paster for RecordingPaster {
        fn paste(&self, text: &str) -> Result<()> {
            self.pasted.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct BracketProcessor;

    #[async_trait]
    impl TextProcessing for BracketProcessor {
        async fn process(&self, text: &str) -> Result<String> {
            Ok(format!("[{text}]"))
        }
    }

    struct FakeWakeSession {
        events: UnboundedSender<RecognizerEvent>,
    }

    impl RecognizerSession for FakeWakeSession {
        fn stop(&self) {
            let _ = self.events.send(RecognizerEvent::Ended);
        }

        fn abort(&self) {
            let _ = self.events.send(RecognizerEvent::Ended);
        }
    }

    #[derive(Default)]
    struct FakeRecognizer {
        sessions: Mutex<Vec<UnboundedSender<RecognizerEvent>>>,
    }

    impl FakeRecognizer {
        fn open_count(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }

        fn hear(&self, index: usize, text: &str) {
            let fragment = RecognitionFragment {
                is_final: false,
                alternatives: vec![RecognitionAlternative {
                    text: text.to_string(),
                    confidence: 0.9,
                }],
            };
            let _ = self.sessions.lock().unwrap()[index].send(RecognizerEvent::Result(fragment));
        }
    }

    #[async_trait]
    impl StreamingRecognizerBackend for FakeRecognizer {
        async fn open(
            &self,
            _config: RecognizerConfig,
            events: UnboundedSender<RecognizerEvent>,
        ) -> Result<Box<dyn RecognizerSession>> {
            self.sessions.lock().unwrap().push(events.clone());
            Ok(Box::new(FakeWakeSession { events }))
        }
    }

    /* ---------- rig ---------- */

    struct Rig {
        manager: SessionManager,
        rx: broadcast::Receiver<SessionEvent>,
        adapter: Arc<FakeAdapter>,
        paster: Arc<RecordingPaster>,
    }

    impl Rig {
        fn events(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn build_rig(
        settings: AppSettings,
        adapter: FakeAdapter,
        deps: EngineDeps,
        processor: Option<Arc<dyn TextProcessing>>,
    ) -> Rig {
        let adapter = Arc::new(adapter);
        let paster = RecordingPaster::new();
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let factory_adapter = adapter.clone();
        let services = SessionServices {
            paster: paster.clone(),
            processor,
            adapter_factory: Some(Box::new(move |_, _| {
                Ok(factory_adapter.clone() as Arc<dyn EngineAdapter>)
            })),
            mic_probe: Some(Box::new(|| Ok(()))),
            ..Default::default()
        };
        let manager = SessionManager::new(Arc::new(MemorySettings::new(settings)), deps, services, bus);
        Rig {
            manager,
            rx,
            adapter,
            paster,
        }
    }

    fn rig(mode: SilenceMode) -> Rig {
        build_rig(
            get_default_settings(),
            FakeAdapter::new(mode),
            EngineDeps::default(),
            None,
        )
    }

    fn phases(events: &[SessionEvent]) -> Vec<SessionPhase> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::PhaseChanged { phase } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    fn completed(events: &[SessionEvent]) -> Vec<HistoryEntry> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Completed { entry } => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        for _ in 0..32 {
            yield_now().await;
        }
    }

    /// Advance paused time in poll-interval-sized chunks.
    async fn step(ms: u64) {
        let mut remaining = ms;
        while remaining > 0 {
            let chunk = remaining.min(200);
            advance(Duration::from_millis(chunk)).await;
            settle().await;
            remaining -= chunk;
        }
    }

    /* ---------- tests ---------- */

    #[tokio::test(start_paused = true)]
    async fn test_double_start_runs_single_session() {
        let r = rig(SilenceMode::Internal);
        r.manager.start(SessionTrigger::Manual).await;
        r.manager.start(SessionTrigger::Manual).await;
        settle().await;

        assert!(r.manager.is_active());
        assert_eq!(r.adapter.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_session_is_noop() {
        let mut r = rig(SilenceMode::Internal);
        r.manager.stop().await;
        settle().await;

        assert!(!r.manager.is_active());
        assert_eq!(r.adapter.finalizes(), 0);
        assert!(completed(&r.events()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_pipeline_processes_and_pastes() {
        let mut adapter = FakeAdapter::new(SilenceMode::Internal);
        adapter.confidence = Some(0.93);
        let mut r = build_rig(
            get_default_settings(),
            adapter,
            EngineDeps::default(),
            Some(Arc::new(BracketProcessor)),
        );

        r.manager.start(SessionTrigger::Manual).await;
        settle().await;
        r.adapter.send(AdapterEvent::Interim {
            text: "toplantı".to_string(),
        });
        r.adapter.send(AdapterEvent::Final {
            text: "toplantı notları".to_string(),
        });
        settle().await;
        advance(Duration::from_secs(3)).await;
        settle().await;

        r.adapter.set_transcript("  toplantı notları  ");
        r.manager.stop().await;
        settle().await;

        let events = r.events();
        assert!(events.contains(&SessionEvent::InterimTranscript {
            text: "toplantı".to_string()
        }));
        assert!(events.contains(&SessionEvent::FinalTranscript {
            text: "toplantı notları".to_string()
        }));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, SessionEvent::DurationTick { .. })),
            "elapsed ticks missing: {events:?}"
        );
        let seen = phases(&events);
        assert_eq!(
            seen,
            vec![
                SessionPhase::Recording,
                SessionPhase::Finishing,
                SessionPhase::Idle
            ]
        );

        let entries = completed(&events);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.text, "[toplantı notları]");
        assert_eq!(entry.original_text.as_deref(), Some("toplantı notları"));
        assert_eq!(entry.engine, EngineKind::Stream);
        assert_eq!(entry.model_id, "native-stream");
        assert_eq!(entry.language, "tr");
        assert_eq!(entry.duration_ms, 3000);
        assert_eq!(entry.confidence, Some(0.93));

        assert_eq!(r.paster.texts(), vec!["[toplantı notları]".to_string()]);
        assert_eq!(
            r.manager.history().lock().unwrap().entries().len(),
            1
        );
        assert!(!r.manager.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_transcript_skips_pipeline() {
        let mut r = rig(SilenceMode::Internal);
        r.manager.start(SessionTrigger::Manual).await;
        settle().await;
        r.adapter.set_transcript("   ");
        r.manager.stop().await;
        settle().await;

        let events = r.events();
        assert!(completed(&events).is_empty());
        assert!(r.paster.texts().is_empty());
        assert!(r.manager.history().lock().unwrap().entries().is_empty());
        assert_eq!(phases(&events).last(), Some(&SessionPhase::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_monitor_stops_wake_session() {
        let mut adapter = FakeAdapter::new(SilenceMode::Polling);
        let levels = FakeLevels::new(0.05);
        adapter.levels = Some(levels.clone());
        let mut r = build_rig(
            get_default_settings(),
            adapter,
            EngineDeps::default(),
            None,
        );

        r.manager.start(SessionTrigger::WakeWord).await;
        settle().await;
        r.adapter.set_transcript("sessizlikten önce söylenen");

        step(2000).await;
        levels.set(0.0);
        step(4600).await;

        assert!(!r.manager.is_active());
        assert_eq!(r.adapter.finalizes(), 1);
        let entries = completed(&r.events());
        assert_eq!(entries.len(), 1, "exactly one forced stop");
        let duration = entries[0].duration_ms;
        assert!(
            (6000..=6600).contains(&duration),
            "expected ~6.1s session, got {duration} ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_session_skips_silence_monitor() {
        let mut adapter = FakeAdapter::new(SilenceMode::Polling);
        let levels = FakeLevels::new(0.05);
        adapter.levels = Some(levels.clone());
        let r = build_rig(
            get_default_settings(),
            adapter,
            EngineDeps::default(),
            None,
        );

        r.manager.start(SessionTrigger::Manual).await;
        settle().await;
        step(2000).await;
        levels.set(0.0);
        step(10_000).await;

        assert!(r.manager.is_active(), "push-to-talk must ignore silence");
        assert_eq!(r.adapter.finalizes(), 0);
        r.manager.stop().await;
        assert_eq!(r.adapter.finalizes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_timeout_only_for_wake_sessions() {
        let r = rig(SilenceMode::Internal);

        r.manager.start(SessionTrigger::WakeWord).await;
        settle().await;
        assert_eq!(
            *r.adapter.captured_timeout.lock().unwrap(),
            Some(Duration::from_secs(4))
        );
        r.manager.stop().await;
        settle().await;

        r.manager.start(SessionTrigger::Manual).await;
        settle().await;
        assert_eq!(*r.adapter.captured_timeout.lock().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_forces_stop() {
        let mut settings = get_default_settings();
        settings.max_record_duration = 3;
        let mut r = build_rig(
            settings,
            FakeAdapter::new(SilenceMode::Internal),
            EngineDeps::default(),
            None,
        );

        r.manager.start(SessionTrigger::Manual).await;
        settle().await;
        r.adapter.set_transcript("süre doldu");

        advance(Duration::from_secs(3)).await;
        settle().await;

        assert!(!r.manager.is_active());
        let entries = completed(&r.events());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].duration_ms, 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_end_runs_finalize_path() {
        let mut r = rig(SilenceMode::Internal);
        r.manager.start(SessionTrigger::Manual).await;
        settle().await;
        r.adapter.set_transcript("kendi kendine bitti");

        r.adapter.send(AdapterEvent::End);
        settle().await;

        assert!(!r.manager.is_active());
        assert_eq!(r.adapter.finalizes(), 1);
        let entries = completed(&r.events());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "kendi kendine bitti");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_events_after_stop_are_discarded() {
        let mut r = rig(SilenceMode::Internal);
        r.manager.start(SessionTrigger::Manual).await;
        settle().await;
        r.manager.stop().await;
        settle().await;
        r.events();

        r.adapter.send(AdapterEvent::Interim {
            text: "geç kalan".to_string(),
        });
        r.adapter.send(AdapterEvent::End);
        settle().await;

        let events = r.events();
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SessionEvent::InterimTranscript { .. })),
            "stale interim leaked: {events:?}"
        );
        assert_eq!(r.adapter.finalizes(), 1, "stale End must not re-finalize");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_engine_start_wins() {
        let mut adapter = FakeAdapter::new(SilenceMode::Internal);
        adapter.start_delay = Some(Duration::from_millis(100));
        let mut r = build_rig(
            get_default_settings(),
            adapter,
            EngineDeps::default(),
            None,
        );

        let manager = r.manager.clone();
        tokio::spawn(async move {
            manager.start(SessionTrigger::Manual).await;
        });
        settle().await;
        assert!(r.manager.is_active(), "session must be claimed before setup");

        r.adapter.set_transcript("yarıda kesildi");
        r.manager.stop().await;
        settle().await;
        assert!(!r.manager.is_active());
        assert_eq!(completed(&r.events()).len(), 1);

        // The in-flight start completes and tears itself down.
        advance(Duration::from_millis(100)).await;
        settle().await;
        assert!(!r.manager.is_active());
        assert_eq!(r.adapter.starts(), 1);
        assert_eq!(r.adapter.finalizes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_reports_error_and_rearms_wake() {
        let mut settings = get_default_settings();
        settings.voice_activation = true;
        let adapter = FakeAdapter::new(SilenceMode::Internal);
        *adapter.fail_start.lock().unwrap() = Some(
            EngineError::missing_config("Deepgram API key is not set").into(),
        );
        let recognizer = Arc::new(FakeRecognizer::default());
        let deps = EngineDeps {
            transcriber: None,
            recognizer: Some(recognizer.clone() as Arc<dyn StreamingRecognizerBackend>),
        };
        let mut r = build_rig(settings, adapter, deps, None);

        r.manager.start(SessionTrigger::Manual).await;
        settle().await;

        assert!(!r.manager.is_active());
        let events = r.events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Error { message } if message.contains("missing configuration")
        )));

        // Grace delay, then the listener claims the microphone again.
        time::sleep(Duration::from_millis(700)).await;
        settle().await;
        assert_eq!(recognizer.open_count(), 1);
        assert!(r.manager.is_wake_word_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_detection_starts_session_and_rearms_after() {
        let mut settings = get_default_settings();
        settings.voice_activation = true;
        let recognizer = Arc::new(FakeRecognizer::default());
        let deps = EngineDeps {
            transcriber: None,
            recognizer: Some(recognizer.clone() as Arc<dyn StreamingRecognizerBackend>),
        };
        let mut r = build_rig(settings, FakeAdapter::new(SilenceMode::Internal), deps, None);

        r.manager.enable_wake_word().await;
        settle().await;
        advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(recognizer.open_count(), 1);

        recognizer.hear(0, "fısıltı not al");
        settle().await;

        assert!(r.manager.is_active(), "detection must start a session");
        assert_eq!(r.adapter.starts(), 1);
        assert_eq!(
            *r.adapter.captured_timeout.lock().unwrap(),
            Some(Duration::from_secs(4)),
            "hands-free session gets the internal silence timeout"
        );
        assert!(!r.manager.is_wake_word_active());
        let events = r.events();
        assert!(events.contains(&SessionEvent::WakeWord(WakeWordState::Detected)));

        r.adapter.set_transcript("not alındı");
        r.manager.stop().await;
        settle().await;
        assert_eq!(completed(&r.events()).len(), 1);

        time::sleep(Duration::from_millis(700)).await;
        settle().await;
        assert_eq!(recognizer.open_count(), 2, "listener re-arms after the stop");
        assert!(r.manager.is_wake_word_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_mode_times_out_after_speech_end() {
        let r = rig(SilenceMode::Native);
        r.manager.start(SessionTrigger::WakeWord).await;
        settle().await;
        r.adapter.set_transcript("bitti");

        r.adapter.send(AdapterEvent::SpeechStart);
        settle().await;
        step(6000).await;
        assert!(r.manager.is_active(), "timer must not run while speaking");

        r.adapter.send(AdapterEvent::SpeechEnd);
        settle().await;
        step(3800).await;
        assert!(r.manager.is_active());
        step(400).await;

        assert!(!r.manager.is_active());
        assert_eq!(r.adapter.finalizes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_recorded_for_cloud_sessions() {
        let mut settings = get_default_settings();
        settings.transcription_engine = EngineKind::Deepgram;
        let mut r = build_rig(
            settings,
            FakeAdapter::new(SilenceMode::Native),
            EngineDeps::default(),
            None,
        );

        r.manager.start(SessionTrigger::Manual).await;
        settle().await;
        r.adapter.set_transcript("bir iki üç");
        advance(Duration::from_secs(3)).await;
        settle().await;
        r.manager.stop().await;
        settle().await;

        let usage = r.manager.usage();
        let minutes = usage.lock().unwrap().deepgram.minutes_used;
        assert!((minutes - 0.05).abs() < 1e-9, "3 s is 0.05 min, got {minutes}");
        assert_eq!(usage.lock().unwrap().azure.minutes_used, 0.0);

        let entries = completed(&r.events());
        assert_eq!(entries[0].model_id, "deepgram-nova-3");
        assert_eq!(entries[0].confidence, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_levels_published() {
        let mut adapter = FakeAdapter::new(SilenceMode::Polling);
        adapter.levels = Some(FakeLevels::new(0.42));
        let mut r = build_rig(
            get_default_settings(),
            adapter,
            EngineDeps::default(),
            None,
        );

        r.manager.start(SessionTrigger::Manual).await;
        settle().await;
        step(300).await;

        let levels: Vec<f32> = r
            .events()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::AudioLevel { level } => Some(*level),
                _ => None,
            })
            .collect();
        assert!(!levels.is_empty());
        assert!(levels.iter().all(|level| (level - 0.42).abs() < f32::EPSILON));
    }
}
