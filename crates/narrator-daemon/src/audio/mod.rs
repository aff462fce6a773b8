//! Mono float audio buffers and the assembly steps applied between synthesis
//! and packaging: concatenation, resampling, speed change and loudness.

mod resampler;
mod wav;

pub use resampler::{resample, resample_linear};
pub use wav::{decode_wav, encode_wav, wav_stream_header};

use anyhow::Result;

pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Intermediate rates used by [`change_speed`] are kept inside this band.
const SPEED_RATE_MIN: u32 = 8_000;
const SPEED_RATE_MAX: u32 = 96_000;
const SPEED_EPSILON: f32 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn empty(sample_rate: u32) -> Self {
        Self::new(Vec::new(), sample_rate)
    }

    pub fn silence(sample_rate: u32, duration_ms: u64) -> Self {
        let len = (sample_rate as u64 * duration_ms / 1000) as usize;
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Truncating millisecond duration, matching how caption offsets accumulate.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    /// Little-endian signed 16-bit PCM, clipped to [-1, 1] first.
    pub fn to_pcm16(&self) -> Vec<u8> {
        float_to_pcm16(&self.samples)
    }

    /// Compact byte form used for cache payloads: sample rate followed by f32 samples.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.samples.len() * 4);
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 || (bytes.len() - 4) % 4 != 0 {
            return None;
        }
        let sample_rate = u32::from_le_bytes(bytes[..4].try_into().ok()?);
        let samples = bytes[4..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Some(Self::new(samples, sample_rate))
    }
}

pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    out
}

pub fn pcm16_to_float(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Sample-wise append in order. Buffers at a different rate than the first
/// are resampled to it; an empty input yields an empty buffer at the default rate.
pub fn concat(buffers: &[AudioBuffer]) -> Result<AudioBuffer> {
    let Some(first) = buffers.first() else {
        return Ok(AudioBuffer::empty(DEFAULT_SAMPLE_RATE));
    };
    let sample_rate = first.sample_rate;
    let total = buffers.iter().map(AudioBuffer::len).sum();
    let mut samples = Vec::with_capacity(total);
    for buffer in buffers {
        if buffer.sample_rate == sample_rate {
            samples.extend_from_slice(&buffer.samples);
        } else {
            samples.extend(resample(buffer, sample_rate)?.samples);
        }
    }
    Ok(AudioBuffer::new(samples, sample_rate))
}

/// Tempo change through a resample pair: the samples are declared at
/// `rate * factor` and then resampled back to `rate`. Duration scales by
/// `1 / factor` and everything downstream keeps reasoning in one fixed rate.
/// Pitch moves with tempo; this is not a phase vocoder.
pub fn change_speed(buffer: &AudioBuffer, factor: f32) -> Result<AudioBuffer> {
    if !factor.is_finite() || factor <= 0.0 || (factor - 1.0).abs() <= SPEED_EPSILON {
        return Ok(buffer.clone());
    }
    let rate = buffer.sample_rate;
    let declared =
        ((rate as f32 * factor).round() as u32).clamp(SPEED_RATE_MIN, SPEED_RATE_MAX);
    if declared == rate {
        return Ok(buffer.clone());
    }
    resample(&AudioBuffer::new(buffer.samples.clone(), declared), rate)
}

#[derive(Debug, Clone, Copy)]
pub struct Loudness {
    pub target_dbfs: f32,
    pub min_gain: f32,
    pub max_gain: f32,
}

impl Default for Loudness {
    fn default() -> Self {
        Self {
            target_dbfs: -20.0,
            min_gain: 0.25,
            max_gain: 8.0,
        }
    }
}

/// RMS normalisation with bounded gain so near-silence is not blown up into noise.
pub fn normalize_rms(buffer: &AudioBuffer, loudness: Loudness) -> AudioBuffer {
    if buffer.is_empty() {
        return buffer.clone();
    }
    let mean_square = buffer
        .samples
        .iter()
        .map(|s| (*s as f64) * (*s as f64))
        .sum::<f64>()
        / buffer.len() as f64;
    let rms = (mean_square + 1e-12).sqrt() as f32;
    let target = 10f32.powf(loudness.target_dbfs / 20.0);
    let gain = (target / rms.max(1e-6)).clamp(loudness.min_gain, loudness.max_gain);
    let samples = buffer
        .samples
        .iter()
        .map(|s| (s * gain).clamp(-1.0, 1.0))
        .collect();
    AudioBuffer::new(samples, buffer.sample_rate)
}

/// Splits a buffer into PCM16 frames of roughly `frame_ms` each.
pub fn pcm16_frames(buffer: &AudioBuffer, frame_ms: u32) -> Vec<Vec<u8>> {
    let frame = ((buffer.sample_rate as u64 * frame_ms.max(1) as u64) / 1000).max(1) as usize;
    buffer.samples.chunks(frame).map(float_to_pcm16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize, rate: u32) -> AudioBuffer {
        AudioBuffer::new(
            (0..len).map(|i| (i as f32 / len as f32) * 2.0 - 1.0).collect(),
            rate,
        )
    }

    #[test]
    fn concat_of_split_buffer_is_identity() {
        let original = ramp(1000, 24_000);
        for cuts in [vec![1usize], vec![10, 500], vec![3, 4, 5, 999]] {
            let mut parts = Vec::new();
            let mut start = 0;
            for cut in cuts.iter().copied().chain(std::iter::once(original.len())) {
                parts.push(AudioBuffer::new(
                    original.samples[start..cut].to_vec(),
                    original.sample_rate,
                ));
                start = cut;
            }
            assert_eq!(concat(&parts).unwrap(), original);
        }
    }

    #[test]
    fn concat_of_nothing_is_empty_at_default_rate() {
        let out = concat(&[]).unwrap();
        assert!(out.is_empty());
        assert_eq!(out.sample_rate, DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn speed_change_scales_duration_and_keeps_rate() {
        let input = AudioBuffer::new(vec![0.1; 24_000], 24_000);
        let faster = change_speed(&input, 1.5).unwrap();
        assert_eq!(faster.sample_rate, 24_000);
        let expected = 24_000.0 / 1.5;
        assert!((faster.len() as f32 - expected).abs() < 50.0, "len {}", faster.len());

        let unchanged = change_speed(&input, 1.005).unwrap();
        assert_eq!(unchanged.len(), input.len());
    }

    #[test]
    fn normalization_clamps_gain_on_near_silence() {
        let quiet = AudioBuffer::new(vec![1e-5; 100], 16_000);
        let out = normalize_rms(&quiet, Loudness::default());
        assert!((out.samples[0] - 8e-5).abs() < 1e-7);

        let loud = AudioBuffer::new(vec![0.9; 100], 16_000);
        let out = normalize_rms(&loud, Loudness::default());
        assert!(out.samples.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(out.samples[0] < 0.9);
    }

    #[test]
    fn byte_form_restores_buffer() {
        let buffer = ramp(33, 22_050);
        assert_eq!(AudioBuffer::from_bytes(&buffer.to_bytes()), Some(buffer));
        assert_eq!(AudioBuffer::from_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn pcm16_is_clipped() {
        let bytes = float_to_pcm16(&[2.0, -2.0, 0.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32767);
    }

    #[test]
    fn frames_cover_the_buffer() {
        let buffer = AudioBuffer::new(vec![0.0; 1000], 24_000);
        let frames = pcm16_frames(&buffer, 30);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames.iter().map(Vec::len).sum::<usize>(), 2000);
        assert!(frames.iter().all(|f| f.len() % 2 == 0));
    }
}
