//! On-device batch engine: capture the whole utterance, then hand the
//! buffer to a host-supplied transcriber in one shot. No interim results.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc::UnboundedSender;

use super::{AdapterEvent, EngineAdapter, EngineError, SilenceMode};
use crate::audio_toolkit::{AudioLevelSource, AudioRecorder, TARGET_SAMPLE_RATE};

/// Minimum clip length submitted for decoding. Very short clips make
/// speech models hallucinate, so anything shorter is zero-padded.
const MIN_SAMPLES: usize = TARGET_SAMPLE_RATE as usize * 5 / 4;

/// One-shot transcription of a full 16 kHz mono buffer. Supplied by the
/// host shell; this crate does not ship a model runtime.
#[async_trait]
pub trait LocalTranscriber: Send + Sync {
    async fn transcribe(&self, samples: &[f32], language: &str) -> Result<String>;
}

pub struct LocalEngine {
    transcriber: Arc<dyn LocalTranscriber>,
    recorder: AudioRecorder,
    language: Mutex<String>,
    events: Mutex<Option<UnboundedSender<AdapterEvent>>>,
}

impl LocalEngine {
    pub fn new(transcriber: Arc<dyn LocalTranscriber>) -> Result<Self> {
        Ok(Self {
            transcriber,
            recorder: AudioRecorder::new()?,
            language: Mutex::new(String::new()),
            events: Mutex::new(None),
        })
    }
}

fn padded(mut samples: Vec<f32>) -> Vec<f32> {
    if samples.len() < MIN_SAMPLES {
        samples.resize(MIN_SAMPLES, 0.0);
    }
    samples
}

#[async_trait]
impl EngineAdapter for LocalEngine {
    async fn start(
        &self,
        language: &str,
        device: Option<&str>,
        _silence_timeout: Option<Duration>,
        events: UnboundedSender<AdapterEvent>,
    ) -> Result<()> {
        self.recorder
            .open(device)
            .map_err(|e| EngineError::device(format!("{:#}", e)))?;
        self.recorder
            .start()
            .map_err(|e| EngineError::device(format!("{:#}", e)))?;
        *self.language.lock().unwrap() = language.to_string();
        *self.events.lock().unwrap() = Some(events);
        info!("On-device engine recording ({})", language);
        Ok(())
    }

    async fn finalize(&self) -> Result<String> {
        let events = self.events.lock().unwrap().take();
        if !self.recorder.is_recording() {
            return Ok(String::new());
        }
        if let Some(tx) = &events {
            let _ = tx.send(AdapterEvent::Transcribing);
        }
        let samples = self.recorder.stop()?;
        self.recorder.close()?;
        if samples.is_empty() {
            debug!("No audio captured, skipping transcription");
            return Ok(String::new());
        }
        let language = self.language.lock().unwrap().clone();
        info!(
            "Transcribing {} samples ({:.1}s)",
            samples.len(),
            samples.len() as f32 / TARGET_SAMPLE_RATE as f32
        );
        let text = self
            .transcriber
            .transcribe(&padded(samples), &language)
            .await
            .context("on-device transcription failed")?;
        Ok(text.trim().to_string())
    }

    fn silence_mode(&self) -> SilenceMode {
        SilenceMode::Polling
    }

    fn level_source(&self) -> Option<Arc<dyn AudioLevelSource>> {
        Some(Arc::new(self.recorder.level_handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTranscriber;

    #[async_trait]
    impl LocalTranscriber for EchoTranscriber {
        async fn transcribe(&self, samples: &[f32], _language: &str) -> Result<String> {
            Ok(format!("{} samples", samples.len()))
        }
    }

    #[test]
    fn test_short_clips_are_padded() {
        let out = padded(vec![0.5; 100]);
        assert_eq!(out.len(), MIN_SAMPLES);
        assert_eq!(out[0], 0.5);
        assert_eq!(out[MIN_SAMPLES - 1], 0.0);
    }

    #[test]
    fn test_long_clips_pass_through() {
        let out = padded(vec![0.1; MIN_SAMPLES * 2]);
        assert_eq!(out.len(), MIN_SAMPLES * 2);
    }

    #[tokio::test]
    async fn test_finalize_without_start_is_empty() {
        let engine = LocalEngine::new(Arc::new(EchoTranscriber)).unwrap();
        assert_eq!(engine.finalize().await.unwrap(), "");
    }
}
