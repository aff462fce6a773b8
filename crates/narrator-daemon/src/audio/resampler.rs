//! Sample-rate conversion: windowed sinc via rubato, linear interpolation as the fallback.

use anyhow::{Result, bail};
use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use tracing::debug;

use super::AudioBuffer;

pub fn resample(buffer: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    if buffer.sample_rate == 0 || target_rate == 0 {
        bail!(
            "cannot resample between {} Hz and {} Hz",
            buffer.sample_rate,
            target_rate
        );
    }
    if buffer.sample_rate == target_rate || buffer.is_empty() {
        return Ok(AudioBuffer::new(buffer.samples.clone(), target_rate));
    }

    let samples = match resample_sinc(&buffer.samples, buffer.sample_rate, target_rate) {
        Ok(samples) => samples,
        Err(err) => {
            debug!(?err, "sinc resampler rejected input, falling back to linear");
            resample_linear(&buffer.samples, buffer.sample_rate, target_rate)
        }
    };
    Ok(AudioBuffer::new(samples, target_rate))
}

/// Linear interpolation over `t = i / rate`, holding the last sample past the end.
pub fn resample_linear(samples: &[f32], from_sr: u32, to_sr: u32) -> Vec<f32> {
    if from_sr == to_sr || samples.is_empty() || from_sr == 0 || to_sr == 0 {
        return samples.to_vec();
    }
    let out_len = expected_len(samples.len(), from_sr, to_sr);
    let step = from_sr as f64 / to_sr as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

fn expected_len(len: usize, from_sr: u32, to_sr: u32) -> usize {
    (len as f64 * to_sr as f64 / from_sr as f64).round() as usize
}

fn resample_sinc(samples: &[f32], from_sr: u32, to_sr: u32) -> Result<Vec<f32>> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        to_sr as f64 / from_sr as f64,
        2.0,
        params,
        samples.len(),
        1,
    )?;

    let delay = resampler.output_delay();
    let expected = expected_len(samples.len(), from_sr, to_sr);

    let input = vec![samples.to_vec()];
    let mut out = resampler
        .process(&input, None)?
        .into_iter()
        .next()
        .unwrap_or_default();

    // The filter delays output; flush with silence until the tail is out.
    while out.len() < delay + expected {
        let tail = resampler
            .process_partial(None::<&[Vec<f32>]>, None)?
            .into_iter()
            .next()
            .unwrap_or_default();
        if tail.is_empty() {
            break;
        }
        out.extend(tail);
    }

    let mut aligned: Vec<f32> = out.into_iter().skip(delay).take(expected).collect();
    aligned.resize(expected, 0.0);
    for sample in &mut aligned {
        *sample = sample.clamp(-1.0, 1.0);
    }
    Ok(aligned)
}
