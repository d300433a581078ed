use anyhow::Result;
use hound::{WavSpec, WavWriter};
use std::io::Cursor;

/// Convert f32 samples in [-1, 1] to little-endian 16-bit PCM bytes,
/// the chunk format the cloud streaming engines expect.
pub fn pcm16_le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let sample_i16 = (clamped * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&sample_i16.to_le_bytes());
    }
    bytes
}

/// Encode samples as a complete mono 16 kHz PCM16 WAV in memory.
pub fn encode_wav_pcm16(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for sample in samples {
            let clamped = sample.clamp(-1.0, 1.0);
            writer.write_sample((clamped * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// A WAV header with data length zero, for protocols that send the header
/// first and raw PCM afterwards.
pub fn wav_header_pcm16(sample_rate: u32) -> Result<Vec<u8>> {
    encode_wav_pcm16(&[], sample_rate)
}
