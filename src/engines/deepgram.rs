//! Deepgram live streaming engine. The capture is resampled to 16 kHz
//! mono and streamed as linear16 PCM over a WebSocket; interim and final
//! fragments come back on the same socket and accumulate into one
//! transcript.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use super::{AdapterEvent, EngineAdapter, EngineError, SilenceMode};
use crate::audio_toolkit::{pcm16_le_bytes, AudioLevelSource, AudioRecorder, TARGET_SAMPLE_RATE};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Trailing finals can still arrive after CloseStream; give them a moment.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

fn listen_url(language: &str) -> String {
    // Deepgram wants the bare language code, not a locale tag.
    let lang = language.split('-').next().unwrap_or(language);
    format!(
        "wss://api.deepgram.com/v1/listen?model=nova-3&language={}&punctuate=true\
         &smart_format=true&interim_results=true&encoding=linear16&sample_rate={}\
         &channels=1&vad_events=true&utterance_end_ms=1500",
        lang, TARGET_SAMPLE_RATE
    )
}

#[derive(Deserialize)]
struct DgMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_final: bool,
    channel: Option<DgChannel>,
}

#[derive(Deserialize)]
struct DgChannel {
    alternatives: Vec<DgAlternative>,
}

#[derive(Deserialize)]
struct DgAlternative {
    transcript: String,
}

fn append_segment(transcript: &mut String, segment: &str) {
    if !transcript.is_empty() {
        transcript.push(' ');
    }
    transcript.push_str(segment);
}

fn display_text(committed: &str, interim: &str) -> String {
    if committed.is_empty() {
        interim.to_string()
    } else {
        format!("{} {}", committed, interim)
    }
}

struct ActiveStream {
    close_tx: UnboundedSender<()>,
    task: JoinHandle<()>,
}

pub struct DeepgramEngine {
    api_key: String,
    recorder: AudioRecorder,
    frame_tx: Arc<Mutex<Option<UnboundedSender<Vec<f32>>>>>,
    transcript: Arc<Mutex<String>>,
    active: Mutex<Option<ActiveStream>>,
}

impl DeepgramEngine {
    pub fn new(api_key: String) -> Result<Self> {
        let frame_tx: Arc<Mutex<Option<UnboundedSender<Vec<f32>>>>> =
            Arc::new(Mutex::new(None));
        let slot = frame_tx.clone();
        let recorder = AudioRecorder::new()?.with_frame_callback(move |frame| {
            if let Some(tx) = slot.lock().unwrap().as_ref() {
                let _ = tx.send(frame.to_vec());
            }
        });
        Ok(Self {
            api_key,
            recorder,
            frame_tx,
            transcript: Arc::new(Mutex::new(String::new())),
            active: Mutex::new(None),
        })
    }
}

fn handle_text(
    raw: &str,
    events: &UnboundedSender<AdapterEvent>,
    transcript: &Arc<Mutex<String>>,
) {
    let Ok(msg) = serde_json::from_str::<DgMessage>(raw) else {
        debug!("Unparsed Deepgram message: {}", &raw[..raw.len().min(200)]);
        return;
    };
    match msg.kind.as_str() {
        "Results" => {
            let Some(text) = msg
                .channel
                .as_ref()
                .and_then(|c| c.alternatives.first())
                .map(|a| a.transcript.trim())
            else {
                return;
            };
            if text.is_empty() {
                return;
            }
            if msg.is_final {
                let full = {
                    let mut committed = transcript.lock().unwrap();
                    append_segment(&mut committed, text);
                    committed.clone()
                };
                let _ = events.send(AdapterEvent::Final { text: full });
            } else {
                let full = display_text(&transcript.lock().unwrap(), text);
                let _ = events.send(AdapterEvent::Interim { text: full });
            }
        }
        "SpeechStarted" => {
            let _ = events.send(AdapterEvent::SpeechStart);
        }
        "UtteranceEnd" => {
            let _ = events.send(AdapterEvent::SpeechEnd);
        }
        other => debug!("Deepgram message ignored: {}", other),
    }
}

async fn run_stream(
    mut ws: WsStream,
    mut frames: UnboundedReceiver<Vec<f32>>,
    mut close_rx: UnboundedReceiver<()>,
    events: UnboundedSender<AdapterEvent>,
    transcript: Arc<Mutex<String>>,
) {
    let mut frames_open = true;
    loop {
        tokio::select! {
            frame = frames.recv(), if frames_open => {
                match frame {
                    Some(frame) => {
                        if ws.send(Message::Binary(pcm16_le_bytes(&frame))).await.is_err() {
                            // the read side reports the failure
                            frames_open = false;
                        }
                    }
                    None => frames_open = false,
                }
            }
            Some(()) = close_rx.recv() => {
                debug!("Sending CloseStream");
                let _ = ws.send(Message::Text(r#"{"type":"CloseStream"}"#.to_string())).await;
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(raw))) => handle_text(&raw, &events, &transcript),
                    Some(Ok(Message::Close(frame))) => {
                        let benign = frame
                            .as_ref()
                            .map(|f| matches!(f.code, CloseCode::Normal | CloseCode::Away))
                            .unwrap_or(true);
                        if !benign {
                            let reason = frame
                                .map(|f| format!("code={}, reason={}", f.code, f.reason))
                                .unwrap_or_default();
                            let _ = events.send(AdapterEvent::Error(EngineError::transport(
                                format!("Deepgram closed the session: {}", reason),
                            )));
                        }
                        let _ = events.send(AdapterEvent::End);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(AdapterEvent::Error(EngineError::transport(
                            format!("Deepgram socket error: {}", e),
                        )));
                        let _ = events.send(AdapterEvent::End);
                        break;
                    }
                    None => {
                        let _ = events.send(AdapterEvent::End);
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EngineAdapter for DeepgramEngine {
    async fn start(
        &self,
        language: &str,
        device: Option<&str>,
        _silence_timeout: Option<Duration>,
        events: UnboundedSender<AdapterEvent>,
    ) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(EngineError::missing_config("Deepgram API key is not set").into());
        }

        let mut request = listen_url(language)
            .into_client_request()
            .map_err(|e| EngineError::transport(format!("invalid request: {}", e)))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", self.api_key).parse().map_err(|_| {
                EngineError::missing_config("Deepgram API key is not a valid header value")
            })?,
        );

        let (ws, _) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| EngineError::transport("Deepgram connection timed out"))?
                .map_err(|e| EngineError::transport(format!("Deepgram connection failed: {}", e)))?;
        info!("Deepgram session open ({})", language);

        self.transcript.lock().unwrap().clear();
        let (frame_in, frame_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        *self.frame_tx.lock().unwrap() = Some(frame_in);

        // capture opens after the socket so no audio is dropped silently
        if let Err(e) = self
            .recorder
            .open(device)
            .and_then(|_| self.recorder.start())
        {
            *self.frame_tx.lock().unwrap() = None;
            return Err(EngineError::device(format!("{:#}", e)).into());
        }

        let task = tokio::spawn(run_stream(
            ws,
            frame_rx,
            close_rx,
            events,
            self.transcript.clone(),
        ));
        *self.active.lock().unwrap() = Some(ActiveStream { close_tx, task });
        Ok(())
    }

    async fn finalize(&self) -> Result<String> {
        *self.frame_tx.lock().unwrap() = None;
        if self.recorder.is_recording() {
            let _ = self.recorder.stop();
        }
        if let Err(e) = self.recorder.close() {
            warn!("Failed to close capture: {:#}", e);
        }

        let active = self.active.lock().unwrap().take();
        if let Some(ActiveStream { close_tx, mut task }) = active {
            let _ = close_tx.send(());
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                debug!("Deepgram did not close within grace period, aborting");
                task.abort();
            }
        }
        Ok(self.transcript.lock().unwrap().clone())
    }

    fn silence_mode(&self) -> SilenceMode {
        SilenceMode::Native
    }

    fn level_source(&self) -> Option<Arc<dyn AudioLevelSource>> {
        Some(Arc::new(self.recorder.level_handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        UnboundedSender<AdapterEvent>,
        UnboundedReceiver<AdapterEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_listen_url_uses_bare_language() {
        let url = listen_url("tr-TR");
        assert!(url.contains("language=tr&"));
        assert!(url.contains("model=nova-3"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("interim_results=true"));
    }

    #[test]
    fn test_finals_accumulate_with_spaces() {
        let (tx, mut rx) = channel();
        let transcript = Arc::new(Mutex::new(String::new()));
        let final1 = r#"{"type":"Results","is_final":true,"channel":{"alternatives":[{"transcript":"merhaba"}]}}"#;
        let final2 = r#"{"type":"Results","is_final":true,"channel":{"alternatives":[{"transcript":"dünya"}]}}"#;
        handle_text(final1, &tx, &transcript);
        handle_text(final2, &tx, &transcript);
        assert_eq!(*transcript.lock().unwrap(), "merhaba dünya");
        assert_eq!(
            rx.try_recv().unwrap(),
            AdapterEvent::Final {
                text: "merhaba".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            AdapterEvent::Final {
                text: "merhaba dünya".to_string()
            }
        );
    }

    #[test]
    fn test_interim_carries_committed_prefix() {
        let (tx, mut rx) = channel();
        let transcript = Arc::new(Mutex::new("merhaba".to_string()));
        let interim = r#"{"type":"Results","is_final":false,"channel":{"alternatives":[{"transcript":"nasıl"}]}}"#;
        handle_text(interim, &tx, &transcript);
        assert_eq!(
            rx.try_recv().unwrap(),
            AdapterEvent::Interim {
                text: "merhaba nasıl".to_string()
            }
        );
        // interim never mutates the committed transcript
        assert_eq!(*transcript.lock().unwrap(), "merhaba");
    }

    #[test]
    fn test_empty_results_are_dropped() {
        let (tx, mut rx) = channel();
        let transcript = Arc::new(Mutex::new(String::new()));
        let empty = r#"{"type":"Results","is_final":true,"channel":{"alternatives":[{"transcript":"  "}]}}"#;
        handle_text(empty, &tx, &transcript);
        assert!(rx.try_recv().is_err());
        assert_eq!(*transcript.lock().unwrap(), "");
    }

    #[test]
    fn test_vad_messages_map_to_speech_events() {
        let (tx, mut rx) = channel();
        let transcript = Arc::new(Mutex::new(String::new()));
        handle_text(r#"{"type":"SpeechStarted"}"#, &tx, &transcript);
        handle_text(r#"{"type":"UtteranceEnd"}"#, &tx, &transcript);
        assert_eq!(rx.try_recv().unwrap(), AdapterEvent::SpeechStart);
        assert_eq!(rx.try_recv().unwrap(), AdapterEvent::SpeechEnd);
    }

    #[tokio::test]
    async fn test_start_without_key_is_config_error() {
        let engine = DeepgramEngine::new(String::new()).unwrap();
        let (tx, _rx) = channel();
        let err = engine.start("tr", None, None, tx).await.unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert_eq!(engine_err.kind, super::super::EngineErrorKind::MissingConfig);
    }

    #[tokio::test]
    async fn test_finalize_without_session_returns_accumulated() {
        let engine = DeepgramEngine::new("key".to_string()).unwrap();
        *engine.transcript.lock().unwrap() = "kalan metin".to_string();
        assert_eq!(engine.finalize().await.unwrap(), "kalan metin");
    }
}
