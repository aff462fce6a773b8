//! Caption timing. Short requests go through an external forced aligner;
//! everything else, and every aligner failure, falls back to timing derived
//! from chunk durations.

mod captions;
mod mfa;
mod textgrid;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub use captions::{format_timestamp, srt_to_vtt, to_srt};
pub use mfa::MfaAligner;
pub use textgrid::{UtteranceBounds, spoken_bounds};

use crate::{
    audio::AudioBuffer,
    capability::CapabilityTier,
    config::AlignmentConfig,
    text::{TextChunk, total_chars},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentSpan {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("aligner not found: {0}")]
    NotFound(String),
    #[error("aligner exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("malformed aligner output: {0}")]
    Malformed(String),
    #[error("aligner timed out after {0:?}")]
    Timeout(Duration),
    #[error("aligner I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentMode {
    /// External alignment while the text is under the host's threshold.
    #[default]
    Auto,
    /// External alignment regardless of length.
    Always,
    /// Duration-derived timing only.
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignStage {
    ExternalAlign,
    SimpleTiming,
}

#[async_trait]
pub trait ForcedAligner: Send + Sync {
    /// Spoken extent of each chunk, relative to the start of that chunk's audio.
    async fn align(
        &self,
        chunks: &[TextChunk],
        buffers: &[AudioBuffer],
    ) -> Result<Vec<UtteranceBounds>, AlignError>;
}

#[derive(Debug, Clone)]
pub struct Timeline {
    pub spans: Vec<AlignmentSpan>,
    pub stage: AlignStage,
}

pub fn choose_stage(
    align_requested: bool,
    mode: AlignmentMode,
    total_chars: usize,
    threshold: usize,
) -> AlignStage {
    match (align_requested, mode) {
        (false, _) | (true, AlignmentMode::Fast) => AlignStage::SimpleTiming,
        (true, AlignmentMode::Always) => AlignStage::ExternalAlign,
        (true, AlignmentMode::Auto) if total_chars <= threshold => AlignStage::ExternalAlign,
        (true, AlignmentMode::Auto) => AlignStage::SimpleTiming,
    }
}

/// Millisecond offset of every chunk boundary, `n + 1` values starting at 0.
/// Accumulated in microseconds so per-chunk truncation does not drift.
fn chunk_boundaries_ms(buffers: &[AudioBuffer]) -> Vec<u64> {
    let mut boundaries = Vec::with_capacity(buffers.len() + 1);
    boundaries.push(0);
    let mut elapsed_us = 0u64;
    for buffer in buffers {
        if buffer.sample_rate > 0 {
            elapsed_us += buffer.len() as u64 * 1_000_000 / buffer.sample_rate as u64;
        }
        boundaries.push(elapsed_us / 1000);
    }
    boundaries
}

/// Each chunk spans exactly its own audio.
pub fn simple_timing(chunks: &[TextChunk], buffers: &[AudioBuffer]) -> Vec<AlignmentSpan> {
    let boundaries = chunk_boundaries_ms(buffers);
    chunks
        .iter()
        .zip(boundaries.windows(2))
        .map(|(chunk, window)| AlignmentSpan {
            start_ms: window[0],
            end_ms: window[1],
            text: chunk.text.trim().to_string(),
        })
        .collect()
}

/// Places aligned extents on the global timeline and closes the gaps: two
/// neighbouring spans meet halfway through the pause between them, the
/// first starts at zero and the last ends with the audio.
pub fn aligned_timing(
    chunks: &[TextChunk],
    buffers: &[AudioBuffer],
    bounds: &[UtteranceBounds],
) -> Vec<AlignmentSpan> {
    let offsets = chunk_boundaries_ms(buffers);
    let total = offsets.last().copied().unwrap_or(0);
    let absolute: Vec<(u64, u64)> = bounds
        .iter()
        .zip(&offsets)
        .map(|(b, offset)| {
            let start = (offset + (b.start_secs.max(0.0) * 1000.0).round() as u64).min(total);
            let end = offset + (b.end_secs.max(0.0) * 1000.0).round() as u64;
            (start, end.clamp(start, total))
        })
        .collect();

    let mut spans = Vec::with_capacity(chunks.len());
    let mut start = 0;
    for (i, chunk) in chunks.iter().enumerate() {
        let end = match absolute.get(i + 1) {
            Some(next) => {
                let mid = (absolute[i].1 + next.0) / 2;
                mid.clamp(start, total)
            }
            None => total,
        };
        spans.push(AlignmentSpan {
            start_ms: start,
            end_ms: end,
            text: chunk.text.trim().to_string(),
        });
        start = end;
    }
    spans
}

pub struct AlignmentPipeline {
    aligner: Arc<dyn ForcedAligner>,
    standard_threshold: usize,
    high_threshold: usize,
}

impl AlignmentPipeline {
    pub fn new(aligner: Arc<dyn ForcedAligner>, config: &AlignmentConfig) -> Self {
        Self {
            aligner,
            standard_threshold: config.standard_threshold,
            high_threshold: config.high_threshold,
        }
    }

    pub fn threshold(&self, tier: CapabilityTier) -> usize {
        match tier {
            CapabilityTier::Standard => self.standard_threshold,
            CapabilityTier::High => self.high_threshold,
        }
    }

    /// Never fails: aligner problems are logged and answered with simple timing.
    pub async fn run(
        &self,
        chunks: &[TextChunk],
        buffers: &[AudioBuffer],
        align_requested: bool,
        mode: AlignmentMode,
        tier: CapabilityTier,
    ) -> Timeline {
        let chars = total_chars(chunks);
        let threshold = self.threshold(tier);
        let stage = choose_stage(align_requested, mode, chars, threshold);
        info!(?stage, chars, threshold, "Caption timing");

        if stage == AlignStage::ExternalAlign {
            match self.aligner.align(chunks, buffers).await {
                Ok(bounds) if bounds.len() == chunks.len() => {
                    return Timeline {
                        spans: aligned_timing(chunks, buffers, &bounds),
                        stage,
                    };
                }
                Ok(bounds) => warn!(
                    expected = chunks.len(),
                    got = bounds.len(),
                    "Aligner returned the wrong number of utterances, using simple timing"
                ),
                Err(err) => warn!(?err, "Forced alignment failed, using simple timing"),
            }
        }

        Timeline {
            spans: simple_timing(chunks, buffers),
            stage: AlignStage::SimpleTiming,
        }
    }
}
