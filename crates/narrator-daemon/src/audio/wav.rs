use std::io::Cursor;

use anyhow::{Context, Result, bail};

use super::AudioBuffer;

/// 16-bit PCM mono WAV in memory.
pub fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + buffer.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in &buffer.samples {
            let scaled = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            writer.write_sample(scaled)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Reads 16-bit integer or 32-bit float WAV, downmixing to mono. A data
/// chunk cut short (ranged downloads) yields the samples read so far.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).context("not a readable WAV stream")?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => read_available(reader.samples::<i16>())?
            .into_iter()
            .map(|v| v as f32 / 32768.0)
            .collect(),
        (hound::SampleFormat::Float, 32) => read_available(reader.samples::<f32>())?,
        (format, bits) => bail!("unsupported WAV sample format {format:?} at {bits} bits"),
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

fn read_available<T>(samples: impl Iterator<Item = hound::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for sample in samples {
        match sample {
            Ok(value) => out.push(value),
            Err(err) if out.is_empty() => return Err(err.into()),
            Err(_) => break,
        }
    }
    Ok(out)
}

/// RIFF header for a live stream: both size fields carry 0xFFFFFFFF because
/// the total length is unknown when the first byte goes out.
pub fn wav_stream_header(sample_rate: u32) -> Vec<u8> {
    let channels = 1u16;
    let bits_per_sample = 16u16;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;

    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&u32::MAX.to_le_bytes());
    header.extend_from_slice(b"WAVEfmt ");
    header.extend_from_slice(&16u32.to_le_bytes()); // PCM chunk size
    header.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    header.extend_from_slice(&channels.to_le_bytes());
    header.extend_from_slice(&sample_rate.to_le_bytes());
    header.extend_from_slice(&byte_rate.to_le_bytes());
    header.extend_from_slice(&block_align.to_le_bytes());
    header.extend_from_slice(&bits_per_sample.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&u32::MAX.to_le_bytes());
    header
}
