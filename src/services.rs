//! Collaborator services around the session core: settings access,
//! history persistence, cloud usage accounting, and text insertion into
//! the foreground app.

use crate::engines::EngineKind;
use crate::events::HistoryEntry;
use crate::settings::AppSettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MAX_HISTORY_ENTRIES: usize = 500;

/// Read access to the live settings. The orchestrator snapshots them at
/// session start; changes mid-session apply to the next session.
pub trait SettingsProvider: Send + Sync {
    fn current(&self) -> AppSettings;
}

/// Settings held in memory, mutated through the control surface.
pub struct MemorySettings {
    inner: Mutex<AppSettings>,
}

impl MemorySettings {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            inner: Mutex::new(settings),
        }
    }

    pub fn update(&self, apply: impl FnOnce(&mut AppSettings)) {
        let mut settings = self.inner.lock().unwrap();
        apply(&mut settings);
    }

    pub fn replace(&self, settings: AppSettings) {
        *self.inner.lock().unwrap() = settings;
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::new(crate::settings::get_default_settings())
    }
}

impl SettingsProvider for MemorySettings {
    fn current(&self) -> AppSettings {
        self.inner.lock().unwrap().clone()
    }
}

/// Post-processing applied to the raw transcript before it is recorded
/// and pasted. A failure falls back to the raw text.
#[async_trait]
pub trait TextProcessing: Send + Sync {
    async fn process(&self, text: &str) -> Result<String>;
}

/// Inserts finalized text into the foreground application. Implemented by
/// the embedding shell; failures are reported but never fail a session.
pub trait Paster: Send + Sync {
    fn paste(&self, text: &str) -> Result<()>;
}

/// Paster that does nothing, for headless use and tests.
pub struct NullPaster;

impl Paster for NullPaster {
    fn paste(&self, _text: &str) -> Result<()> {
        Ok(())
    }
}

/// Transcription history, newest first, capped at 500 entries. With a
/// backing path every mutation is persisted; without one it is in-memory
/// only.
pub struct HistoryStore {
    entries: Vec<HistoryEntry>,
    path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Default)]
struct HistoryFile {
    entries: Vec<HistoryEntry>,
}

impl HistoryStore {
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            path: None,
        }
    }

    /// Open a file-backed store. A missing or unreadable file starts empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<HistoryFile>(&raw).ok())
            .map(|file| file.entries)
            .unwrap_or_default();
        Self {
            entries,
            path: Some(path),
        }
    }

    pub fn add(&mut self, entry: HistoryEntry) {
        self.entries.insert(0, entry);
        if self.entries.len() > MAX_HISTORY_ENTRIES {
            self.entries.truncate(MAX_HISTORY_ENTRIES);
        }
        self.persist();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = HistoryFile {
            entries: self.entries.clone(),
        };
        match serde_json::to_string_pretty(&file) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    log::warn!("Failed to persist history: {}", e);
                }
            }
            Err(e) => log::warn!("Failed to serialize history: {}", e),
        }
    }
}

/* ---------- cloud usage accounting ---------- */

/// Free-tier minute budgets. Deepgram's is a one-time credit pool, the
/// other two renew monthly.
const DEEPGRAM_LIMIT_MINUTES: f64 = 20000.0;
const AZURE_LIMIT_MINUTES: f64 = 300.0;
const GOOGLE_LIMIT_MINUTES: f64 = 60.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderUsage {
    pub minutes_used: f64,
    /// "YYYY-MM" of the last monthly reset.
    pub last_reset_date: String,
}

impl ProviderUsage {
    fn new(month: &str) -> Self {
        Self {
            minutes_used: 0.0,
            last_reset_date: month.to_string(),
        }
    }
}

/// Tracks minutes consumed per cloud provider so the shell can warn
/// before a free tier runs out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLedger {
    pub deepgram: ProviderUsage,
    pub azure: ProviderUsage,
    pub google_cloud: ProviderUsage,
}

pub fn current_month() -> String {
    chrono::Local::now().format("%Y-%m").to_string()
}

impl Default for UsageLedger {
    fn default() -> Self {
        let month = current_month();
        Self {
            deepgram: ProviderUsage::new(&month),
            azure: ProviderUsage::new(&month),
            google_cloud: ProviderUsage::new(&month),
        }
    }
}

impl UsageLedger {
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let mut ledger = std::fs::read_to_string(path.as_ref())
            .ok()
            .and_then(|raw| serde_json::from_str::<UsageLedger>(&raw).ok())
            .unwrap_or_default();
        ledger.reset_if_new_month(&current_month());
        ledger
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("failed to write usage file {:?}", path.as_ref()))
    }

    pub fn record(&mut self, engine: EngineKind, duration_ms: u64) {
        self.record_for_month(engine, duration_ms, &current_month());
    }

    pub fn record_for_month(&mut self, engine: EngineKind, duration_ms: u64, month: &str) {
        self.reset_if_new_month(month);
        if let Some(usage) = self.provider_mut(engine) {
            usage.minutes_used += duration_ms as f64 / 60_000.0;
        }
    }

    /// Minutes left in the free tier, `None` for engines with no quota.
    pub fn remaining(&self, engine: EngineKind) -> Option<f64> {
        let (usage, limit) = match engine {
            EngineKind::Deepgram => (&self.deepgram, DEEPGRAM_LIMIT_MINUTES),
            EngineKind::Azure => (&self.azure, AZURE_LIMIT_MINUTES),
            EngineKind::GoogleCloud => (&self.google_cloud, GOOGLE_LIMIT_MINUTES),
            EngineKind::Local | EngineKind::Stream => return None,
        };
        Some((limit - usage.minutes_used).max(0.0))
    }

    /// Monthly rollover. Deepgram's credit pool survives the month change,
    /// only its reset date moves forward.
    pub fn reset_if_new_month(&mut self, month: &str) {
        if self.deepgram.last_reset_date != month {
            self.deepgram.last_reset_date = month.to_string();
        }
        if self.azure.last_reset_date != month {
            self.azure = ProviderUsage::new(month);
        }
        if self.google_cloud.last_reset_date != month {
            self.google_cloud = ProviderUsage::new(month);
        }
    }

    pub fn reset_provider(&mut self, engine: EngineKind) {
        let month = current_month();
        if let Some(usage) = self.provider_mut(engine) {
            *usage = ProviderUsage::new(&month);
        }
    }

    fn provider_mut(&mut self, engine: EngineKind) -> Option<&mut ProviderUsage> {
        match engine {
            EngineKind::Deepgram => Some(&mut self.deepgram),
            EngineKind::Azure => Some(&mut self.azure),
            EngineKind::GoogleCloud => Some(&mut self.google_cloud),
            EngineKind::Local | EngineKind::Stream => None,
        }
    }
}
