//! WAV encoding, decoding and sample-format conversion.
//!
//! The pipeline operates on 16-bit/16 kHz/mono PCM end to end. Anything
//! arriving as WAV (a decoder request, a chime file) passes through
//! [`wav_to_pcm`] which requantizes, mixes down and resamples as needed.

use crate::error::{AssistantError, Result};
use std::io::Cursor;

/// Encode 16-bit mono PCM samples as an in-memory WAV buffer.
///
/// # Errors
///
/// Returns an audio error if WAV encoding fails.
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AssistantError::Audio(format!("WAV encode: {e}")))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| AssistantError::Audio(format!("WAV encode: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| AssistantError::Audio(format!("WAV encode: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV buffer to 16-bit mono PCM at the requested sample rate.
///
/// Handles integer widths up to 32 bits and IEEE float sources, mixes
/// multi-channel audio down by averaging, and resamples by linear
/// interpolation (sufficient for speech; energy above 8 kHz is irrelevant
/// to the decoder).
///
/// # Errors
///
/// Returns an audio error when the buffer is not a readable WAV.
pub fn wav_to_pcm(wav: &[u8], target_rate: u32) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::new(Cursor::new(wav))
        .map_err(|e| AssistantError::Audio(format!("WAV decode: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| v as f32 / max)
                        .map_err(|e| AssistantError::Audio(format!("WAV decode: {e}")))
                })
                .collect::<Result<Vec<f32>>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(|e| AssistantError::Audio(format!("WAV decode: {e}"))))
            .collect::<Result<Vec<f32>>>()?,
    };

    let mono = if spec.channels > 1 {
        to_mono(&samples, spec.channels)
    } else {
        samples
    };

    let resampled = if spec.sample_rate != target_rate {
        resample(&mono, spec.sample_rate, target_rate)
    } else {
        mono
    };

    Ok(resampled
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect())
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
pub(crate) fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_wav_round_trip() {
        let samples: Vec<i16> = (0..480).map(|i| (i % 100) as i16 * 300).collect();
        let wav = pcm_to_wav(&samples, 16_000).unwrap();
        let decoded = wav_to_pcm(&wav, 16_000).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn stereo_mixes_down() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..100 {
                writer.write_sample(1000i16).unwrap();
                writer.write_sample(3000i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let pcm = wav_to_pcm(&cursor.into_inner(), 16_000).unwrap();
        assert_eq!(pcm.len(), 100);
        // Averaged channels, within quantization error.
        assert!((pcm[0] - 2000).abs() <= 1);
    }

    #[test]
    fn downsamples_to_target_rate() {
        let samples: Vec<i16> = vec![0; 48_000];
        let wav = pcm_to_wav(&samples, 48_000).unwrap();
        let pcm = wav_to_pcm(&wav, 16_000).unwrap();
        // One second of audio at either rate.
        assert_eq!(pcm.len(), 16_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(wav_to_pcm(b"not a wav", 16_000).is_err());
    }
}
