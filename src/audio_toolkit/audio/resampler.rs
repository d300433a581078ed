use rubato::{FftFixedIn, Resampler};
use std::time::Duration;

const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Streaming resampler that turns an arbitrary-rate sample feed into
/// fixed-duration frames at the output rate. Input arrives in whatever
/// chunk sizes the capture callback delivers; complete frames are handed
/// to `emit` as soon as they fill up.
pub struct FrameResampler {
    resampler: Option<FftFixedIn<f32>>,
    chunk_in: usize,
    in_buf: Vec<f32>,
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameResampler {
    pub fn new(in_hz: usize, out_hz: usize, frame_dur: Duration) -> Self {
        let frame_samples = ((out_hz as f64 * frame_dur.as_secs_f64()).round()) as usize;
        assert!(frame_samples > 0, "frame duration too short");

        let chunk_in = RESAMPLER_CHUNK_SIZE;

        let resampler = (in_hz != out_hz).then(|| {
            FftFixedIn::<f32>::new(in_hz, out_hz, chunk_in, 1, 1)
                .expect("Failed to create resampler")
        });

        Self {
            resampler,
            chunk_in,
            in_buf: Vec::with_capacity(chunk_in),
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    pub fn push(&mut self, mut src: &[f32], mut emit: impl FnMut(&[f32])) {
        if self.resampler.is_none() {
            self.emit_frames(src, &mut emit);
            return;
        }

        while !src.is_empty() {
            let space = self.chunk_in - self.in_buf.len();
            let take = space.min(src.len());
            self.in_buf.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.in_buf.len() == self.chunk_in {
                if let Ok(out) = self
                    .resampler
                    .as_mut()
                    .unwrap()
                    .process(&[&self.in_buf[..]], None)
                {
                    self.emit_frames(&out[0], &mut emit);
                }
                self.in_buf.clear();
            }
        }
    }

    /// Flush buffered input and the partial trailing frame, zero-padded.
    pub fn finish(&mut self, mut emit: impl FnMut(&[f32])) {
        if let Some(ref mut resampler) = self.resampler {
            if !self.in_buf.is_empty() {
                self.in_buf.resize(self.chunk_in, 0.0);
                if let Ok(out) = resampler.process(&[&self.in_buf[..]], None) {
                    self.emit_frames(&out[0], &mut emit);
                }
                self.in_buf.clear();
            }
        }

        if !self.pending.is_empty() {
            self.pending.resize(self.frame_samples, 0.0);
            emit(&self.pending);
            self.pending.clear();
        }
    }

    fn emit_frames(&mut self, mut data: &[f32], emit: &mut impl FnMut(&[f32])) {
        while !data.is_empty() {
            let space = self.frame_samples - self.pending.len();
            let take = space.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == self.frame_samples {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_emits_fixed_frames() {
        let mut rs = FrameResampler::new(16000, 16000, Duration::from_millis(100));
        let mut frames = Vec::new();
        rs.push(&vec![0.5; 4000], |f| frames.push(f.len()));
        assert_eq!(frames, vec![1600, 1600]);
        rs.finish(|f| frames.push(f.len()));
        // 800 leftover samples flushed as one zero-padded frame
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], 1600);
    }

    #[test]
    fn test_downsample_rate_roughly_halves() {
        let mut rs = FrameResampler::new(32000, 16000, Duration::from_millis(100));
        let mut total = 0usize;
        rs.push(&vec![0.1; 32000], |f| total += f.len());
        rs.finish(|f| total += f.len());
        // one second of input comes out near one second at 16 kHz,
        // rounded up to whole frames
        assert!(total >= 16000 && total <= 16000 + 1600, "total = {}", total);
    }

    #[test]
    fn test_finish_on_empty_is_silent() {
        let mut rs = FrameResampler::new(48000, 16000, Duration::from_millis(30));
        let mut called = false;
        rs.finish(|_| called = true);
        assert!(!called);
    }
}
