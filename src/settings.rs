use crate::engines::EngineKind;
use crate::language::ScoringWeights;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A user-defined find/replace rule applied during post-processing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegexFilter {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppSettings {
    #[serde(default)]
    pub transcription_engine: EngineKind,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub selected_microphone: Option<String>,
    #[serde(default = "default_model")]
    pub selected_model: String,
    /// Speech-detection sensitivity, 0..1. Lower is more sensitive.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    /// Seconds of sustained quiet before a wake-word session auto-stops.
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout: f32,
    /// Hard cap on session length in seconds. 0 disables the cap.
    #[serde(default = "default_max_record_duration")]
    pub max_record_duration: u32,
    #[serde(default = "default_auto_paste")]
    pub auto_paste: bool,
    #[serde(default)]
    pub voice_activation: bool,
    #[serde(default = "default_wake_word")]
    pub wake_word: String,
    #[serde(default)]
    pub deepgram_api_key: String,
    #[serde(default)]
    pub azure_speech_key: String,
    #[serde(default)]
    pub azure_speech_region: String,
    #[serde(default)]
    pub google_cloud_api_key: String,
    #[serde(default)]
    pub custom_words: Vec<String>,
    #[serde(default = "default_word_correction_threshold")]
    pub word_correction_threshold: f64,
    #[serde(default)]
    pub regex_filters: Vec<RegexFilter>,
    #[serde(default = "default_auto_capitalize")]
    pub auto_capitalize: bool,
    #[serde(default = "default_auto_punctuation")]
    pub auto_punctuation: bool,
    #[serde(default)]
    pub scoring: ScoringWeights,
}

impl AppSettings {
    /// Silence timeout in milliseconds. A zero or negative setting falls
    /// back to the 4 s default rather than disabling the timer.
    pub fn silence_timeout_ms(&self) -> u64 {
        if self.silence_timeout > 0.0 {
            (self.silence_timeout * 1000.0).round() as u64
        } else {
            4000
        }
    }

    /// Max recording duration in milliseconds, 0 = unlimited.
    pub fn max_record_duration_ms(&self) -> u64 {
        u64::from(self.max_record_duration) * 1000
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        get_default_settings()
    }
}

fn default_language() -> String {
    "tr".to_string()
}

fn default_model() -> String {
    "".to_string()
}

fn default_vad_threshold() -> f32 {
    0.3
}

fn default_silence_timeout() -> f32 {
    4.0
}

fn default_max_record_duration() -> u32 {
    60
}

fn default_auto_paste() -> bool {
    true
}

fn default_wake_word() -> String {
    "fısıltı".to_string()
}

fn default_word_correction_threshold() -> f64 {
    0.18
}

fn default_auto_capitalize() -> bool {
    true
}

fn default_auto_punctuation() -> bool {
    true
}

pub fn get_default_settings() -> AppSettings {
    AppSettings {
        transcription_engine: EngineKind::default(),
        language: default_language(),
        selected_microphone: None,
        selected_model: default_model(),
        vad_threshold: default_vad_threshold(),
        silence_timeout: default_silence_timeout(),
        max_record_duration: default_max_record_duration(),
        auto_paste: default_auto_paste(),
        voice_activation: false,
        wake_word: default_wake_word(),
        deepgram_api_key: String::new(),
        azure_speech_key: String::new(),
        azure_speech_region: String::new(),
        google_cloud_api_key: String::new(),
        custom_words: Vec::new(),
        word_correction_threshold: default_word_correction_threshold(),
        regex_filters: Vec::new(),
        auto_capitalize: default_auto_capitalize(),
        auto_punctuation: default_auto_punctuation(),
        scoring: ScoringWeights::default(),
    }
}

/// Load settings from a JSON file. Missing fields take their defaults so
/// old settings files keep working across upgrades.
pub fn load_settings_file<P: AsRef<Path>>(path: P) -> Result<AppSettings> {
    let raw = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read settings file {:?}", path.as_ref()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse settings file {:?}", path.as_ref()))
}
