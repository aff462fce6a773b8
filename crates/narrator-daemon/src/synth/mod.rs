//! Chunk-level synthesis: cache partitioning, batch or per-chunk dispatch to
//! the worker pool, and reassembly in chunk order.

mod live;

use std::{sync::Arc, time::Instant};

use anyhow::anyhow;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use live::{LiveFrames, LiveStatus};

use crate::{
    audio::AudioBuffer,
    cache::{CacheKey, SynthesisCache},
    text::TextChunk,
    tts::{BackendError, Engine, SharedBackend, VoiceParams, conform},
    workers::WorkerPool,
};

/// Identifies a synthesis configuration for whole-request caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisParams {
    pub engine: Engine,
    pub voice: String,
    pub speed: f32,
    pub align: bool,
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("accelerator out of memory: {0}")]
    ResourceExhausted(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct SynthesisOutput {
    /// One buffer per chunk, in chunk order, all at `sample_rate`.
    pub buffers: Vec<AudioBuffer>,
    pub sample_rate: u32,
    pub cached: usize,
    /// Chunks that were replaced by silence.
    pub failed: Vec<usize>,
}

struct Pending {
    slot: usize,
    key: CacheKey,
    text: String,
}

pub struct SynthesisOrchestrator {
    cache: Arc<SynthesisCache>,
    pool: WorkerPool,
    failed_chunk_silence_ms: u64,
}

impl SynthesisOrchestrator {
    pub fn new(cache: Arc<SynthesisCache>, pool: WorkerPool, failed_chunk_silence_ms: u64) -> Self {
        Self {
            cache,
            pool,
            failed_chunk_silence_ms,
        }
    }

    pub fn cache(&self) -> &Arc<SynthesisCache> {
        &self.cache
    }

    pub async fn synthesize(
        &self,
        backend: &SharedBackend,
        chunks: &[TextChunk],
        voice: &VoiceParams,
    ) -> Result<SynthesisOutput, SynthesisError> {
        let started = Instant::now();
        let sample_rate = backend.sample_rate();
        let identity = voice.cache_identity();

        let mut slots: Vec<Option<AudioBuffer>> = vec![None; chunks.len()];
        let mut pending = Vec::new();
        for (slot, chunk) in chunks.iter().enumerate() {
            let key = CacheKey::for_chunk(
                backend.engine(),
                &identity,
                backend.lang_code(),
                voice.speed,
                sample_rate,
                &chunk.text,
            );
            let hit = self
                .cache
                .get(&key)
                .and_then(|payload| AudioBuffer::from_bytes(&payload))
                .filter(|buffer| buffer.sample_rate == sample_rate);
            match hit {
                Some(buffer) => slots[slot] = Some(buffer),
                None => pending.push(Pending {
                    slot,
                    key,
                    text: chunk.text.clone(),
                }),
            }
        }
        let cached = chunks.len() - pending.len();
        debug!(chunks = chunks.len(), cached, "Partitioned chunks against cache");

        let results = if pending.is_empty() {
            Vec::new()
        } else if backend.supports_batch() && pending.len() > 1 {
            self.dispatch_batch(backend, pending, voice).await
        } else {
            self.dispatch_each(backend, pending, voice).await
        };

        let mut exhausted = None;
        let mut failed = Vec::new();
        for (job, result) in results {
            match result {
                Ok(buffer) => {
                    self.cache.put(job.key, buffer.to_bytes());
                    slots[job.slot] = Some(buffer);
                }
                Err(BackendError::ResourceExhausted(reason)) => {
                    exhausted.get_or_insert(reason);
                }
                Err(err) => {
                    warn!(chunk = job.slot, ?err, "Chunk synthesis failed, substituting silence");
                    failed.push(job.slot);
                    slots[job.slot] = Some(AudioBuffer::silence(
                        sample_rate,
                        self.failed_chunk_silence_ms,
                    ));
                }
            }
        }

        if let Some(reason) = exhausted {
            if backend.degrade() {
                warn!(engine = %backend.engine(), "Backend degraded after running out of memory");
            }
            return Err(SynthesisError::ResourceExhausted(reason));
        }

        let buffers = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| anyhow!("chunk left without audio"))?;

        info!(
            engine = %backend.engine(),
            chunks = buffers.len(),
            cached,
            failed = failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Synthesized chunks"
        );
        Ok(SynthesisOutput {
            buffers,
            sample_rate,
            cached,
            failed,
        })
    }

    /// One backend call for every pending chunk. Newlines separate units, so
    /// they are flattened out of each text first. A failed or short batch is
    /// retried chunk by chunk.
    async fn dispatch_batch(
        &self,
        backend: &SharedBackend,
        pending: Vec<Pending>,
        voice: &VoiceParams,
    ) -> Vec<(Pending, Result<AudioBuffer, BackendError>)> {
        let texts: Vec<String> = pending
            .iter()
            .map(|job| job.text.replace(['\r', '\n'], " "))
            .collect();
        let expected = texts.len();
        let job_backend = Arc::clone(backend);
        let job_voice = voice.clone();

        let outcome = self
            .pool
            .run(move || {
                job_backend
                    .synthesize_batch(&texts, &job_voice)?
                    .into_iter()
                    .map(|buffer| conform(&*job_backend, buffer, job_voice.speed))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await;

        match outcome {
            Ok(Ok(buffers)) if buffers.len() == expected => {
                return pending.into_iter().zip(buffers.into_iter().map(Ok)).collect();
            }
            Ok(Ok(buffers)) => {
                warn!(expected, got = buffers.len(), "Batch returned wrong segment count, retrying per chunk");
            }
            Ok(Err(BackendError::ResourceExhausted(reason))) => {
                return pending
                    .into_iter()
                    .map(|job| (job, Err(BackendError::ResourceExhausted(reason.clone()))))
                    .collect();
            }
            Ok(Err(err)) => warn!(?err, "Batch synthesis failed, retrying per chunk"),
            Err(err) => warn!(?err, "Batch worker crashed, retrying per chunk"),
        }
        self.dispatch_each(backend, pending, voice).await
    }

    async fn dispatch_each(
        &self,
        backend: &SharedBackend,
        pending: Vec<Pending>,
        voice: &VoiceParams,
    ) -> Vec<(Pending, Result<AudioBuffer, BackendError>)> {
        let jobs = pending.into_iter().map(|job| {
            let backend = Arc::clone(backend);
            let voice = voice.clone();
            let text = job.text.clone();
            let pool = self.pool.clone();
            async move {
                let result = pool
                    .run(move || {
                        let buffer = backend.synthesize(&text, &voice)?;
                        conform(&*backend, buffer, voice.speed)
                    })
                    .await
                    .unwrap_or_else(|err| Err(BackendError::Synthesis(format!("{err:#}"))));
                (job, result)
            }
        });
        join_all(jobs).await
    }
}
