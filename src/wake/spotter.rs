//! Keyphrase spotting by template matching.
//!
//! Compares log filterbank energies of incoming audio against reference
//! recordings of the keyphrase using DTW (dynamic time warping), which
//! tolerates speaking-rate differences. Scores are mapped to [0, 1]; a
//! profile-configured threshold is the detection floor.

use crate::error::{AssistantError, Result};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// FFT window size in samples (25 ms at 16 kHz).
const FRAME_SIZE: usize = 400;
/// Hop size in samples (10 ms at 16 kHz).
const HOP_SIZE: usize = 160;
/// Number of triangular filter bands.
const NUM_BANDS: usize = 20;
/// Required sample rate; audio is not resampled here.
const EXPECTED_SAMPLE_RATE: u32 = 16_000;

/// A reference template: one feature sequence per keyphrase recording.
struct Reference {
    features: Vec<Vec<f32>>,
}

/// Keyphrase spotter comparing live audio against reference recordings.
pub struct KeyphraseSpotter {
    references: Vec<Reference>,
    threshold: f32,
    fft: Arc<dyn Fft<f32>>,
    /// Rolling buffer; one detection window (~1 s) with half-window overlap.
    audio_buffer: Vec<f32>,
    window_samples: usize,
}

impl KeyphraseSpotter {
    /// Load reference recordings from `references_dir` (16 kHz mono WAVs).
    ///
    /// # Errors
    ///
    /// Returns a wake error when no usable reference recording is found.
    pub fn load(references_dir: &Path, threshold: f32, sample_rate: u32) -> Result<Self> {
        if sample_rate != EXPECTED_SAMPLE_RATE {
            return Err(AssistantError::Wake(format!(
                "spotter requires {EXPECTED_SAMPLE_RATE}Hz audio, got {sample_rate}Hz"
            )));
        }

        let fft = FftPlanner::new().plan_fft_forward(FRAME_SIZE);
        let references = load_references(references_dir, &fft)?;
        if references.is_empty() {
            return Err(AssistantError::Wake(format!(
                "no keyphrase reference recordings in {}",
                references_dir.display()
            )));
        }

        info!(
            "spotter loaded {} reference(s), threshold={threshold}",
            references.len()
        );

        Ok(Self {
            references,
            threshold,
            fft,
            audio_buffer: Vec::with_capacity(EXPECTED_SAMPLE_RATE as usize + FRAME_SIZE),
            window_samples: EXPECTED_SAMPLE_RATE as usize,
        })
    }

    /// Feed samples; returns the best match score when it clears the
    /// threshold.
    pub fn process(&mut self, samples: &[i16]) -> Option<f32> {
        self.audio_buffer
            .extend(samples.iter().map(|&s| s as f32 / i16::MAX as f32));

        if self.audio_buffer.len() < self.window_samples {
            return None;
        }

        let window = &self.audio_buffer[self.audio_buffer.len() - self.window_samples..];
        let features = extract_features(window, &self.fft);

        let mut best_score = 0.0f32;
        if !features.is_empty() {
            for reference in &self.references {
                let dist = dtw_distance(&features, &reference.features);
                let score = 1.0 / (1.0 + dist);
                if score > best_score {
                    best_score = score;
                }
            }
        }

        // Slide forward by half a window so detections spanning the
        // boundary are still seen.
        let drain = self.window_samples / 2;
        if self.audio_buffer.len() > drain {
            self.audio_buffer.drain(..drain);
        }

        (best_score >= self.threshold).then_some(best_score)
    }

    /// Drop buffered audio (after a detection or on stop).
    pub fn clear(&mut self) {
        self.audio_buffer.clear();
    }

    /// Number of loaded reference recordings.
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }
}

fn load_references(dir: &Path, fft: &Arc<dyn Fft<f32>>) -> Result<Vec<Reference>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| AssistantError::Wake(format!("cannot read references dir: {e}")))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("wav"))
        .collect();
    paths.sort();

    let mut refs = Vec::new();
    for path in paths {
        match crate::audio::wav::wav_to_pcm(&std::fs::read(&path)?, EXPECTED_SAMPLE_RATE) {
            Ok(samples) => {
                let normalised: Vec<f32> =
                    samples.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                let features = extract_features(&normalised, fft);
                if features.is_empty() {
                    warn!("reference too short, skipping: {}", path.display());
                } else {
                    info!("loaded keyphrase reference: {}", path.display());
                    refs.push(Reference { features });
                }
            }
            Err(e) => warn!("skipping invalid reference {}: {e}", path.display()),
        }
    }

    Ok(refs)
}

/// Extract log filterbank energies, one vector per 10 ms hop.
fn extract_features(samples: &[f32], fft: &Arc<dyn Fft<f32>>) -> Vec<Vec<f32>> {
    if samples.len() < FRAME_SIZE {
        return Vec::new();
    }

    let mut features = Vec::new();
    let mut start = 0;
    while start + FRAME_SIZE <= samples.len() {
        let mut buffer: Vec<Complex<f32>> = samples[start..start + FRAME_SIZE]
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                // Hann window.
                let w = 0.5
                    - 0.5
                        * (2.0 * std::f32::consts::PI * i as f32 / (FRAME_SIZE - 1) as f32).cos();
                Complex::new(s * w, 0.0)
            })
            .collect();
        fft.process(&mut buffer);

        let half = FRAME_SIZE / 2;
        let power: Vec<f32> = buffer[..half].iter().map(|c| c.norm_sqr()).collect();

        // Triangular bands, evenly spaced over the power spectrum.
        let band_width = half / (NUM_BANDS + 1);
        let mut bands = Vec::with_capacity(NUM_BANDS);
        for b in 0..NUM_BANDS {
            let center = (b + 1) * band_width;
            let mut energy = 0.0f32;
            for (offset, &p) in power
                [center.saturating_sub(band_width)..(center + band_width).min(half)]
                .iter()
                .enumerate()
            {
                let pos = center.saturating_sub(band_width) + offset;
                let weight =
                    1.0 - (pos as f32 - center as f32).abs() / band_width.max(1) as f32;
                energy += p * weight.max(0.0);
            }
            bands.push((energy + 1e-10).ln());
        }

        features.push(bands);
        start += HOP_SIZE;
    }

    // Mean-normalise each band across the sequence so overall loudness
    // does not dominate the distance.
    if !features.is_empty() {
        for band in 0..NUM_BANDS {
            let mean: f32 =
                features.iter().map(|f| f[band]).sum::<f32>() / features.len() as f32;
            for frame in &mut features {
                frame[band] -= mean;
            }
        }
    }

    features
}

/// DTW distance between two feature sequences, normalised by path length.
fn dtw_distance(a: &[Vec<f32>], b: &[Vec<f32>]) -> f32 {
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return f32::INFINITY;
    }

    let mut prev = vec![f32::INFINITY; m + 1];
    let mut current = vec![f32::INFINITY; m + 1];
    prev[0] = 0.0;

    for i in 1..=n {
        current[0] = f32::INFINITY;
        for j in 1..=m {
            let cost = euclidean(&a[i - 1], &b[j - 1]);
            let best = prev[j].min(current[j - 1]).min(prev[j - 1]);
            current[j] = cost + best;
        }
        std::mem::swap(&mut prev, &mut current);
    }

    prev[m] / (n + m) as f32
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::pcm_to_wav;

    /// A distinctive two-tone "keyphrase" test signal.
    fn keyphrase_signal(seconds: f32) -> Vec<i16> {
        let len = (seconds * EXPECTED_SAMPLE_RATE as f32) as usize;
        (0..len)
            .map(|i| {
                let t = i as f32 / EXPECTED_SAMPLE_RATE as f32;
                let freq = if t < seconds / 2.0 { 440.0 } else { 880.0 };
                ((2.0 * std::f32::consts::PI * freq * t).sin() * 12_000.0) as i16
            })
            .collect()
    }

    fn write_reference(dir: &Path, samples: &[i16]) {
        std::fs::create_dir_all(dir).unwrap();
        let wav = pcm_to_wav(samples, EXPECTED_SAMPLE_RATE).unwrap();
        std::fs::write(dir.join("ref0.wav"), wav).unwrap();
    }

    #[test]
    fn missing_references_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let result = KeyphraseSpotter::load(&dir.path().join("wake"), 0.5, 16_000);
        assert!(result.is_err());
    }

    #[test]
    fn detects_signal_matching_reference() {
        let dir = tempfile::tempdir().unwrap();
        let signal = keyphrase_signal(1.0);
        write_reference(dir.path(), &signal);

        let mut spotter = KeyphraseSpotter::load(dir.path(), 0.35, 16_000).unwrap();
        assert_eq!(spotter.reference_count(), 1);

        // Feed the keyphrase twice so a full window lines up with it.
        let mut window = signal.clone();
        window.extend_from_slice(&signal);
        let mut detected = false;
        for chunk in window.chunks(480) {
            if spotter.process(chunk).is_some() {
                detected = true;
            }
        }
        assert!(detected, "identical signal should clear the threshold");
    }

    #[test]
    fn silence_does_not_detect() {
        let dir = tempfile::tempdir().unwrap();
        write_reference(dir.path(), &keyphrase_signal(1.0));

        let mut spotter = KeyphraseSpotter::load(dir.path(), 0.9, 16_000).unwrap();
        let silence = vec![0i16; 32_000];
        let mut detected = false;
        for chunk in silence.chunks(480) {
            if spotter.process(chunk).is_some() {
                detected = true;
            }
        }
        assert!(!detected);
    }
}
