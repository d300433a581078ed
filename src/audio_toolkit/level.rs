//! Microphone loudness sources for silence detection.
//!
//! Two implementations exist: [`SharedLevel`] reads the RMS the recorder
//! already computes on its capture path, and [`AudioTap`] opens a
//! dedicated capture stream purely for level sampling, for engines whose
//! audio is captured by an opaque backend. Consumers only see the
//! [`AudioLevelSource`] trait and cannot tell the two apart.

use crate::audio_toolkit::audio::resolve_input_device;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub trait AudioLevelSource: Send + Sync {
    /// Instantaneous loudness, same scale as a time-domain RMS of the
    /// capture buffer. Typical speech lands around 0.01-0.1, silence
    /// below 0.005.
    fn level(&self) -> f32;
}

/// Cheap cloneable handle onto a level another component keeps updated.
#[derive(Clone, Default)]
pub struct SharedLevel(Arc<Mutex<f32>>);

impl SharedLevel {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, value: f32) {
        *self.0.lock().unwrap() = value;
    }
}

impl AudioLevelSource for SharedLevel {
    fn level(&self) -> f32 {
        *self.0.lock().unwrap()
    }
}

const FFT_SIZE: usize = 1024;
/// Rough voice band; energy outside it (hum, hiss) is ignored.
const SPEECH_BAND_HZ: (f32, f32) = (85.0, 3000.0);

/// Sliding-window spectrum analyzer. Levels are the RMS equivalent of the
/// energy inside the speech band, so thresholds tuned against plain RMS
/// keep working while broadband noise is discounted.
pub struct SpectralAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    sample_rate: f32,
}

impl SpectralAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(FFT_SIZE),
            window: Vec::with_capacity(FFT_SIZE),
            sample_rate: sample_rate as f32,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.window.extend_from_slice(samples);
        let excess = self.window.len().saturating_sub(FFT_SIZE);
        if excess > 0 {
            self.window.drain(..excess);
        }
    }

    pub fn level(&self) -> f32 {
        if self.window.len() < FFT_SIZE {
            return 0.0;
        }

        let mut buf: Vec<Complex<f32>> = self
            .window
            .iter()
            .map(|&s| Complex::new(s, 0.0))
            .collect();
        self.fft.process(&mut buf);

        let bin_hz = self.sample_rate / FFT_SIZE as f32;
        let lo = (SPEECH_BAND_HZ.0 / bin_hz).floor() as usize;
        let hi = ((SPEECH_BAND_HZ.1 / bin_hz).ceil() as usize).min(FFT_SIZE / 2);

        // Parseval: sum |x|^2 = (1/N) sum |X|^2, so band RMS is
        // sqrt(sum_band |X|^2) / N, doubled for the conjugate half.
        let band_energy: f32 = buf[lo..=hi].iter().map(|c| c.norm_sqr()).sum();
        (2.0 * band_energy).sqrt() / FFT_SIZE as f32
    }
}

enum TapCommand {
    Shutdown,
}

/// Standalone microphone tap that keeps a [`SpectralAnalyzer`] fed from
/// its own capture stream. Closing the tap releases the device.
pub struct AudioTap {
    handle: TapLevelHandle,
    cmd_tx: mpsc::Sender<TapCommand>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct TapLevelHandle(Arc<Mutex<Option<SpectralAnalyzer>>>);

impl AudioLevelSource for TapLevelHandle {
    fn level(&self) -> f32 {
        self.0
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.level())
            .unwrap_or(0.0)
    }
}

impl AudioTap {
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let analyzer: Arc<Mutex<Option<SpectralAnalyzer>>> = Arc::new(Mutex::new(None));
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let device_name = device_name.map(|s| s.to_string());
        let analyzer_worker = analyzer.clone();
        let worker = std::thread::Builder::new()
            .name("audio-tap".to_string())
            .spawn(move || {
                let stream = match open_tap_stream(device_name.as_deref(), &analyzer_worker) {
                    Ok(stream) => {
                        ready_tx.send(Ok(())).ok();
                        stream
                    }
                    Err(e) => {
                        ready_tx.send(Err(e)).ok();
                        return;
                    }
                };

                // Hold the stream until told to shut down.
                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        TapCommand::Shutdown => break,
                    }
                }
                drop(stream);
            })
            .context("failed to spawn audio tap thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("audio tap thread exited before reporting"))??;

        Ok(Self {
            handle: TapLevelHandle(analyzer),
            cmd_tx,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> TapLevelHandle {
        self.handle.clone()
    }
}

impl Drop for AudioTap {
    fn drop(&mut self) {
        self.cmd_tx.send(TapCommand::Shutdown).ok();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

fn open_tap_stream(
    device_name: Option<&str>,
    analyzer: &Arc<Mutex<Option<SpectralAnalyzer>>>,
) -> Result<cpal::Stream> {
    let device =
        resolve_input_device(device_name).ok_or_else(|| anyhow!("no input device available"))?;
    let config = device
        .default_input_config()
        .context("failed to read input config")?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    *analyzer.lock().unwrap() = Some(SpectralAnalyzer::new(sample_rate));

    let stream_config: cpal::StreamConfig = config.clone().into();
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            build_tap_stream::<f32>(&device, &stream_config, analyzer.clone(), channels)?
        }
        cpal::SampleFormat::I16 => {
            build_tap_stream::<i16>(&device, &stream_config, analyzer.clone(), channels)?
        }
        cpal::SampleFormat::U16 => {
            build_tap_stream::<u16>(&device, &stream_config, analyzer.clone(), channels)?
        }
        format => return Err(anyhow!("unsupported sample format {:?}", format)),
    };

    stream.play().context("failed to start audio tap stream")?;
    Ok(stream)
}

fn build_tap_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    analyzer: Arc<Mutex<Option<SpectralAnalyzer>>>,
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
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|c| f32::from_sample(c[0]))
                .collect();
            if let Some(analyzer) = analyzer.lock().unwrap().as_mut() {
                analyzer.push(&mono);
            }
        },
        |err| log::error!("Audio tap capture error: {}", err),
        None,
    )?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_level_reflects_updates() {
        let level = SharedLevel::new();
        assert_eq!(level.level(), 0.0);
        level.set(0.042);
        assert!((level.level() - 0.042).abs() < 1e-6);
    }

    #[test]
    fn test_spectral_level_zero_before_window_filled() {
        let mut analyzer = SpectralAnalyzer::new(16000);
        analyzer.push(&[0.5; 100]);
        assert_eq!(analyzer.level(), 0.0);
    }

    #[test]
    fn test_spectral_level_tracks_tone_in_band() {
        let mut analyzer = SpectralAnalyzer::new(16000);
        // 440 Hz tone, amplitude 0.2: RMS = 0.2 / sqrt(2)
        let samples: Vec<f32> = (0..FFT_SIZE)
            .map(|n| 0.2 * (2.0 * std::f32::consts::PI * 440.0 * n as f32 / 16000.0).sin())
            .collect();
        analyzer.push(&samples);
        let level = analyzer.level();
        let expected = 0.2 / 2.0_f32.sqrt();
        assert!(
            (level - expected).abs() < 0.02,
            "level {} vs expected {}",
            level,
            expected
        );
    }

    #[test]
    fn test_spectral_level_ignores_out_of_band_hum() {
        let mut analyzer = SpectralAnalyzer::new(16000);
        // 50 Hz mains hum sits below the speech band
        let samples: Vec<f32> = (0..FFT_SIZE)
            .map(|n| 0.3 * (2.0 * std::f32::consts::PI * 50.0 * n as f32 / 16000.0).sin())
            .collect();
        analyzer.push(&samples);
        assert!(analyzer.level() < 0.05);
    }
}
