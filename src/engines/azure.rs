//! Azure Speech dictation engine. Speaks the service's framed WebSocket
//! protocol: text messages carry Path headers and a JSON body, audio goes
//! as length-prefixed binary frames with a WAV header first. Hypotheses
//! map to interims, recognized phrases accumulate into the transcript.

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
use uuid::Uuid;

use super::{AdapterEvent, EngineAdapter, EngineError, SilenceMode};
use crate::audio_toolkit::{
    pcm16_le_bytes, wav_header_pcm16, AudioLevelSource, AudioRecorder, TARGET_SAMPLE_RATE,
};
use crate::language::to_bcp47;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// After end-of-audio the trailing phrase and turn.end normally arrive
/// within a couple of seconds.
const END_GRACE: Duration = Duration::from_secs(2);

fn endpoint_url(region: &str, language: &str) -> String {
    format!(
        "wss://{}.stt.speech.microsoft.com/speech/recognition/dictation/cognitiveservices/v1?language={}&format=simple",
        region,
        to_bcp47(language)
    )
}

fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn text_message(path: &str, request_id: &str, content_type: &str, body: &str) -> String {
    format!(
        "Path:{}\r\nX-RequestId:{}\r\nX-Timestamp:{}\r\nContent-Type:{}\r\n\r\n{}",
        path,
        request_id,
        timestamp(),
        content_type,
        body
    )
}

/// Binary audio frame: big-endian u16 header length, headers, payload.
/// An empty payload tells the service the audio stream is over.
fn audio_message(request_id: &str, payload: &[u8]) -> Vec<u8> {
    let headers = format!(
        "Path:audio\r\nX-RequestId:{}\r\nX-Timestamp:{}\r\nContent-Type:audio/x-wav",
        request_id,
        timestamp()
    );
    let mut frame = Vec::with_capacity(2 + headers.len() + payload.len());
    frame.extend_from_slice(&(headers.len() as u16).to_be_bytes());
    frame.extend_from_slice(headers.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn split_message(raw: &str) -> Option<(&str, &str)> {
    let (headers, body) = raw.split_once("\r\n\r\n")?;
    let path = headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("path").then(|| value.trim())
    })?;
    Some((path, body))
}

#[derive(Deserialize)]
struct Hypothesis {
    #[serde(rename = "Text", default)]
    text: String,
}

#[derive(Deserialize)]
struct Phrase {
    #[serde(rename = "RecognitionStatus", default)]
    recognition_status: String,
    #[serde(rename = "DisplayText", default)]
    display_text: String,
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

/// Returns true when the server signalled the end of the dictation turn.
fn handle_server_text(
    raw: &str,
    events: &UnboundedSender<AdapterEvent>,
    transcript: &Arc<Mutex<String>>,
) -> bool {
    let Some((path, body)) = split_message(raw) else {
        debug!("Unframed Azure message: {}", &raw[..raw.len().min(200)]);
        return false;
    };
    match path {
        "speech.hypothesis" => {
            if let Ok(hyp) = serde_json::from_str::<Hypothesis>(body) {
                if !hyp.text.is_empty() {
                    let full = display_text(&transcript.lock().unwrap(), &hyp.text);
                    let _ = events.send(AdapterEvent::Interim { text: full });
                }
            }
            false
        }
        "speech.phrase" => {
            let Ok(phrase) = serde_json::from_str::<Phrase>(body) else {
                return false;
            };
            match phrase.recognition_status.as_str() {
                "Success" if !phrase.display_text.is_empty() => {
                    let full = {
                        let mut committed = transcript.lock().unwrap();
                        append_segment(&mut committed, &phrase.display_text);
                        committed.clone()
                    };
                    let _ = events.send(AdapterEvent::Final { text: full });
                }
                // turn.end follows shortly after this status
                "EndOfDictation" => debug!("Azure end of dictation"),
                other => debug!("Azure phrase status: {}", other),
            }
            false
        }
        "speech.startDetected" => {
            let _ = events.send(AdapterEvent::SpeechStart);
            false
        }
        "speech.endDetected" => {
            let _ = events.send(AdapterEvent::SpeechEnd);
            false
        }
        "turn.end" => true,
        other => {
            debug!("Azure message ignored: {}", other);
            false
        }
    }
}

async fn run_stream(
    mut ws: WsStream,
    mut frames: UnboundedReceiver<Vec<f32>>,
    mut end_rx: UnboundedReceiver<()>,
    events: UnboundedSender<AdapterEvent>,
    transcript: Arc<Mutex<String>>,
    request_id: String,
) {
    let mut frames_open = true;
    loop {
        tokio::select! {
            frame = frames.recv(), if frames_open => {
                match frame {
                    Some(frame) => {
                        let msg = audio_message(&request_id, &pcm16_le_bytes(&frame));
                        if ws.send(Message::Binary(msg)).await.is_err() {
                            frames_open = false;
                        }
                    }
                    None => frames_open = false,
                }
            }
            Some(()) = end_rx.recv() => {
                debug!("Sending end-of-audio");
                let _ = ws.send(Message::Binary(audio_message(&request_id, &[]))).await;
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(raw))) => {
                        if handle_server_text(&raw, &events, &transcript) {
                            let _ = events.send(AdapterEvent::End);
                            break;
                        }
                    }
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
                                format!("Azure closed the session: {}", reason),
                            )));
                        }
                        let _ = events.send(AdapterEvent::End);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(AdapterEvent::Error(EngineError::transport(
                            format!("Azure socket error: {}", e),
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

struct ActiveStream {
    end_tx: UnboundedSender<()>,
    task: JoinHandle<()>,
}

pub struct AzureEngine {
    api_key: String,
    region: String,
    recorder: AudioRecorder,
    frame_tx: Arc<Mutex<Option<UnboundedSender<Vec<f32>>>>>,
    transcript: Arc<Mutex<String>>,
    active: Mutex<Option<ActiveStream>>,
}

impl AzureEngine {
    pub fn new(api_key: String, region: String) -> Result<Self> {
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
            region,
            recorder,
            frame_tx,
            transcript: Arc::new(Mutex::new(String::new())),
            active: Mutex::new(None),
        })
    }
}

#[async_trait]
impl EngineAdapter for AzureEngine {
    async fn start(
        &self,
        language: &str,
        device: Option<&str>,
        _silence_timeout: Option<Duration>,
        events: UnboundedSender<AdapterEvent>,
    ) -> Result<()> {
        if self.api_key.trim().is_empty() || self.region.trim().is_empty() {
            return Err(
                EngineError::missing_config("Azure Speech key or region is not set").into(),
            );
        }

        let connection_id = Uuid::new_v4().simple().to_string();
        let request_id = Uuid::new_v4().simple().to_string();
        let mut request = endpoint_url(&self.region, language)
            .into_client_request()
            .map_err(|e| EngineError::transport(format!("invalid request: {}", e)))?;
        {
            let headers = request.headers_mut();
            headers.insert(
                "Ocp-Apim-Subscription-Key",
                self.api_key.parse().map_err(|_| {
                    EngineError::missing_config("Azure key is not a valid header value")
                })?,
            );
            headers.insert(
                "X-ConnectionId",
                connection_id.parse().map_err(|_| {
                    EngineError::transport("connection id is not a valid header value")
                })?,
            );
        }

        let (mut ws, _) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| EngineError::transport("Azure connection timed out"))?
                .map_err(|e| EngineError::transport(format!("Azure connection failed: {}", e)))?;
        info!("Azure dictation session open ({}, {})", self.region, language);

        let config = serde_json::json!({
            "context": {
                "system": { "name": "dikte", "version": env!("CARGO_PKG_VERSION") },
                "os": { "platform": std::env::consts::OS, "name": std::env::consts::OS, "version": "" }
            }
        });
        ws.send(Message::Text(text_message(
            "speech.config",
            &request_id,
            "application/json; charset=utf-8",
            &config.to_string(),
        )))
        .await
        .map_err(|e| EngineError::transport(format!("failed to send speech.config: {}", e)))?;

        // WAV header first so the service knows the PCM layout
        let header = wav_header_pcm16(TARGET_SAMPLE_RATE)?;
        ws.send(Message::Binary(audio_message(&request_id, &header)))
            .await
            .map_err(|e| EngineError::transport(format!("failed to send audio header: {}", e)))?;

        self.transcript.lock().unwrap().clear();
        let (frame_in, frame_rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = mpsc::unbounded_channel();
        *self.frame_tx.lock().unwrap() = Some(frame_in);

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
            end_rx,
            events,
            self.transcript.clone(),
            request_id,
        ));
        *self.active.lock().unwrap() = Some(ActiveStream { end_tx, task });
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
        if let Some(ActiveStream { end_tx, mut task }) = active {
            let _ = end_tx.send(());
            if tokio::time::timeout(END_GRACE, &mut task).await.is_err() {
                debug!("Azure turn did not end within grace period, aborting");
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
