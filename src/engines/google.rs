//! Google Cloud Speech-to-Text V2 batch engine. Records like the
//! on-device engine; finalize posts the whole capture as one recognize
//! call and joins the returned segments.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use super::{AdapterEvent, EngineAdapter, EngineError, SilenceMode};
use crate::audio_toolkit::{encode_wav_pcm16, AudioLevelSource, AudioRecorder, TARGET_SAMPLE_RATE};
use crate::language::to_bcp47;

const RECOGNIZE_URL: &str =
    "https://speech.googleapis.com/v2/projects/-/locations/global/recognizers/_:recognize";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognizeRequest {
    config: RecognizeConfig,
    content: String,
    config_mask: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognizeConfig {
    language_codes: Vec<String>,
    model: String,
    features: RecognizeFeatures,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognizeFeatures {
    enable_automatic_punctuation: bool,
}

#[derive(Deserialize, Debug, Default)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognizeResult>,
}

#[derive(Deserialize, Debug)]
struct RecognizeResult {
    #[serde(default)]
    alternatives: Vec<RecognizeAlternative>,
}

#[derive(Deserialize, Debug)]
struct RecognizeAlternative {
    #[serde(default)]
    transcript: String,
}

fn join_transcripts(response: &RecognizeResponse) -> String {
    response
        .results
        .iter()
        .filter_map(|r| r.alternatives.first())
        .map(|a| a.transcript.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct GoogleEngine {
    api_key: String,
    client: reqwest::Client,
    recorder: AudioRecorder,
    language: Mutex<String>,
    events: Mutex<Option<UnboundedSender<AdapterEvent>>>,
}

impl GoogleEngine {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            api_key,
            client: reqwest::Client::new(),
            recorder: AudioRecorder::new()?,
            language: Mutex::new(String::new()),
            events: Mutex::new(None),
        })
    }

    async fn recognize(&self, samples: &[f32], language: &str) -> Result<String> {
        let wav = encode_wav_pcm16(samples, TARGET_SAMPLE_RATE)?;
        let request = RecognizeRequest {
            config: RecognizeConfig {
                language_codes: vec![to_bcp47(language)],
                model: "chirp_2".to_string(),
                features: RecognizeFeatures {
                    enable_automatic_punctuation: true,
                },
            },
            content: base64::engine::general_purpose::STANDARD.encode(&wav),
            config_mask: "languageCodes,model,features.enableAutomaticPunctuation".to_string(),
        };

        let response = self
            .client
            .post(RECOGNIZE_URL)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::transport(format!("recognize request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EngineError::transport(format!(
                "recognize failed (HTTP {}): {}",
                status, error_text
            ))
            .into());
        }

        let parsed: RecognizeResponse = response
            .json()
            .await
            .map_err(|e| EngineError::transport(format!("invalid recognize response: {}", e)))?;
        Ok(join_transcripts(&parsed))
    }
}

#[async_trait]
impl EngineAdapter for GoogleEngine {
    async fn start(
        &self,
        language: &str,
        device: Option<&str>,
        _silence_timeout: Option<Duration>,
        events: UnboundedSender<AdapterEvent>,
    ) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(EngineError::missing_config("Google Cloud API key is not set").into());
        }
        self.recorder
            .open(device)
            .map_err(|e| EngineError::device(format!("{:#}", e)))?;
        self.recorder
            .start()
            .map_err(|e| EngineError::device(format!("{:#}", e)))?;
        *self.language.lock().unwrap() = language.to_string();
        *self.events.lock().unwrap() = Some(events);
        info!("Google Cloud engine recording ({})", language);
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
            debug!("No audio captured, skipping recognize call");
            return Ok(String::new());
        }
        let language = self.language.lock().unwrap().clone();
        info!(
            "Submitting {} samples ({:.1}s) to Google Cloud",
            samples.len(),
            samples.len() as f32 / TARGET_SAMPLE_RATE as f32
        );
        let text = self.recognize(&samples, &language).await?;
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

    #[test]
    fn test_request_wire_shape() {
        let request = RecognizeRequest {
            config: RecognizeConfig {
                language_codes: vec!["tr-TR".to_string()],
                model: "chirp_2".to_string(),
                features: RecognizeFeatures {
                    enable_automatic_punctuation: true,
                },
            },
            content: "AAAA".to_string(),
            config_mask: "languageCodes,model,features.enableAutomaticPunctuation".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""languageCodes":["tr-TR"]"#));
        assert!(json.contains(r#""model":"chirp_2""#));
        assert!(json.contains(r#""enableAutomaticPunctuation":true"#));
        assert!(json.contains(r#""configMask":"languageCodes"#));
    }

    #[test]
    fn test_joins_first_alternatives_only() {
        let response: RecognizeResponse = serde_json::from_str(
            r#"{"results": [
                {"alternatives": [{"transcript": "merhaba"}, {"transcript": "x"}]},
                {"alternatives": [{"transcript": ""}]},
                {"alternatives": [{"transcript": "dünya"}]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(join_transcripts(&response), "merhaba dünya");
    }

    #[test]
    fn test_empty_response_is_empty_text() {
        let response: RecognizeResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(join_transcripts(&response), "");
    }

    #[tokio::test]
    async fn test_start_without_key_is_config_error() {
        let engine = GoogleEngine::new(String::new()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let err = engine.start("tr", None, None, tx).await.unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(engine_err.kind, super::super::EngineErrorKind::MissingConfig);
    }
}
