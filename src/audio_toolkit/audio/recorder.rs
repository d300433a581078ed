use crate::audio_toolkit::audio::{resolve_input_device, FrameResampler};
use crate::audio_toolkit::level::SharedLevel;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Size of the resampled frames handed to the frame callback.
const FRAME_DURATION: Duration = Duration::from_millis(100);

type LevelCallback = Arc<dyn Fn(f32) + Send + Sync>;
type FrameCallback = Arc<dyn Fn(&[f32]) + Send + Sync>;

enum Command {
    Open {
        device_name: Option<String>,
        ack: Sender<Result<()>>,
    },
    Close {
        ack: Sender<()>,
    },
    Shutdown,
}

struct SharedState {
    open: AtomicBool,
    recording: AtomicBool,
    native_rate: AtomicU32,
    level: SharedLevel,
    /// Captured audio, already mono at the target rate.
    buffer: Mutex<Vec<f32>>,
    resampler: Mutex<Option<FrameResampler>>,
    on_level: Mutex<Option<LevelCallback>>,
    on_frame: Mutex<Option<FrameCallback>>,
}

/// Microphone recorder feeding a 16 kHz mono pipeline.
///
/// The cpal stream lives on a dedicated worker thread because streams must
/// not cross threads; the rest of the state is shared and lock-cheap.
/// While recording, capture is resampled incrementally and complete frames
/// are both appended to the take-on-stop buffer and pushed to the optional
/// frame callback, so streaming engines see audio with no added latency.
pub struct AudioRecorder {
    cmd_tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    state: Arc<SharedState>,
}

impl AudioRecorder {
    pub fn new() -> Result<Self> {
        let state = Arc::new(SharedState {
            open: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            native_rate: AtomicU32::new(0),
            level: SharedLevel::new(),
            buffer: Mutex::new(Vec::new()),
            resampler: Mutex::new(None),
            on_level: Mutex::new(None),
            on_frame: Mutex::new(None),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel();
        let worker_state = state.clone();
        let worker = std::thread::Builder::new()
            .name("audio-recorder".to_string())
            .spawn(move || run_worker(cmd_rx, worker_state))
            .context("failed to spawn audio recorder thread")?;

        Ok(Self {
            cmd_tx,
            worker: Some(worker),
            state,
        })
    }

    /// Called with the capture RMS on every callback while the stream is
    /// open, recording or not.
    pub fn with_level_callback(self, cb: impl Fn(f32) + Send + Sync + 'static) -> Self {
        *self.state.on_level.lock().unwrap() = Some(Arc::new(cb));
        self
    }

    /// Called with each complete 16 kHz frame while recording.
    pub fn with_frame_callback(self, cb: impl Fn(&[f32]) + Send + Sync + 'static) -> Self {
        *self.state.on_frame.lock().unwrap() = Some(Arc::new(cb));
        self
    }

    pub fn open(&self, device_name: Option<&str>) -> Result<()> {
        if self.state.open.load(Ordering::SeqCst) {
            debug!("Recorder already open");
            return Ok(());
        }

        let (ack_tx, ack_rx) = mpsc::channel();
        self.cmd_tx
            .send(Command::Open {
                device_name: device_name.map(|s| s.to_string()),
                ack: ack_tx,
            })
            .map_err(|_| anyhow!("audio worker is gone"))?;
        ack_rx
            .recv()
            .map_err(|_| anyhow!("audio worker exited during open"))?
    }

    pub fn start(&self) -> Result<()> {
        if !self.state.open.load(Ordering::SeqCst) {
            return Err(anyhow!("recorder is not open"));
        }

        let native_rate = self.state.native_rate.load(Ordering::SeqCst);
        self.state.buffer.lock().unwrap().clear();
        *self.state.resampler.lock().unwrap() = Some(FrameResampler::new(
            native_rate as usize,
            TARGET_SAMPLE_RATE as usize,
            FRAME_DURATION,
        ));
        self.state.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop recording and take the captured samples. Safe to call when not
    /// recording; returns whatever has accumulated.
    pub fn stop(&self) -> Result<Vec<f32>> {
        self.state.recording.store(false, Ordering::SeqCst);

        {
            // Flush the resampler tail into the buffer. The frame callback
            // is skipped, the session is over.
            let mut resampler = self.state.resampler.lock().unwrap();
            if let Some(rs) = resampler.as_mut() {
                let mut tail = Vec::new();
                rs.finish(|frame| tail.extend_from_slice(frame));
                self.state.buffer.lock().unwrap().extend_from_slice(&tail);
            }
            *resampler = None;
        }

        let samples = std::mem::take(&mut *self.state.buffer.lock().unwrap());
        debug!(
            "Recording stopped, {} samples ({:.1}s)",
            samples.len(),
            samples.len() as f64 / TARGET_SAMPLE_RATE as f64
        );
        Ok(samples)
    }

    pub fn close(&self) -> Result<()> {
        if !self.state.open.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.state.recording.load(Ordering::SeqCst) {
            let _ = self.stop();
        }

        let (ack_tx, ack_rx) = mpsc::channel();
        self.cmd_tx
            .send(Command::Close { ack: ack_tx })
            .map_err(|_| anyhow!("audio worker is gone"))?;
        ack_rx
            .recv()
            .map_err(|_| anyhow!("audio worker exited during close"))?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.state.recording.load(Ordering::SeqCst)
    }

    /// Handle onto the capture RMS for pollers like the silence monitor.
    pub fn level_handle(&self) -> SharedLevel {
        self.state.level.clone()
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        self.cmd_tx.send(Command::Shutdown).ok();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

fn run_worker(cmd_rx: mpsc::Receiver<Command>, state: Arc<SharedState>) {
    let mut stream: Option<cpal::Stream> = None;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            Command::Open { device_name, ack } => {
                stream = None;
                let result = open_stream(device_name.as_deref(), &state);
                match result {
                    Ok(s) => {
                        stream = Some(s);
                        state.open.store(true, Ordering::SeqCst);
                        ack.send(Ok(())).ok();
                    }
                    Err(e) => {
                        ack.send(Err(e)).ok();
                    }
                }
            }
            Command::Close { ack } => {
                stream = None;
                state.open.store(false, Ordering::SeqCst);
                state.recording.store(false, Ordering::SeqCst);
                state.level.set(0.0);
                ack.send(()).ok();
            }
            Command::Shutdown => break,
        }
    }
    drop(stream);
}

fn open_stream(device_name: Option<&str>, state: &Arc<SharedState>) -> Result<cpal::Stream> {
    let device =
        resolve_input_device(device_name).ok_or_else(|| anyhow!("no input device available"))?;
    let config = device
        .default_input_config()
        .context("failed to read input config")?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    state.native_rate.store(sample_rate, Ordering::SeqCst);

    let stream_config: cpal::StreamConfig = config.clone().into();
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            build_capture_stream::<f32>(&device, &stream_config, state.clone(), channels)?
        }
        cpal::SampleFormat::I16 => {
            build_capture_stream::<i16>(&device, &stream_config, state.clone(), channels)?
        }
        cpal::SampleFormat::U16 => {
            build_capture_stream::<u16>(&device, &stream_config, state.clone(), channels)?
        }
        format => return Err(anyhow!("unsupported sample format {:?}", format)),
    };

    stream.play().context("failed to start capture stream")?;
    debug!("Capture open at {}Hz, {} channels", sample_rate, channels);
    Ok(stream)
}

fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    state: Arc<SharedState>,
    channels: usize,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if data.is_empty() {
                return;
            }

            // First channel only; dictation microphones are effectively mono.
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|c| f32::from_sample(c[0]))
                .collect();

            let rms = (mono.iter().map(|s| s * s).sum::<f32>() / mono.len() as f32).sqrt();
            state.level.set(rms);
            if let Some(cb) = state.on_level.lock().unwrap().as_ref() {
                cb(rms);
            }

            if state.recording.load(Ordering::SeqCst) {
                let mut resampler = state.resampler.lock().unwrap();
                if let Some(rs) = resampler.as_mut() {
                    let on_frame = state.on_frame.lock().unwrap();
                    rs.push(&mono, |frame| {
                        state.buffer.lock().unwrap().extend_from_slice(frame);
                        if let Some(cb) = on_frame.as_ref() {
                            cb(frame);
                        }
                    });
                }
            }
        },
        |err| log::error!("Audio capture error: {}", err),
        None,
    )?;
    Ok(stream)
}
