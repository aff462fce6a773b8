//! The request surface: validation, engine resolution, and the three ways a
//! narration leaves the daemon (artifacts, a zip package, or a live stream).

mod error;

use std::{collections::BTreeMap, ops::RangeInclusive, sync::Arc, time::Instant};

use anyhow::{Result, anyhow, ensure};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

pub use error::ServiceError;

use crate::{
    alignment::{AlignStage, AlignmentMode, AlignmentPipeline, ForcedAligner, srt_to_vtt, to_srt},
    audio::{concat, encode_wav, normalize_rms},
    cache::{CacheKey, CacheStatsSnapshot, Clock, SynthesisCache, SystemClock},
    capability::recommend_engine,
    config::AppConfig,
    package::{NarrationArtifacts, PACKAGE_CONTENT_TYPE, PACKAGE_FILE_NAME},
    stream::{StreamEncoding, StreamFramer, spawn_framed},
    synth::{LiveFrames, LiveStatus, SynthesisOrchestrator, SynthesisParams},
    text::{self, TextChunk},
    tts::{
        BackendRegistry, Engine, ReferenceResolver, ReferenceSource, SharedBackend, UnknownEngine,
        VoiceParams,
    },
    workers::WorkerPool,
};

const SPEED_RANGE: RangeInclusive<f32> = 0.25..=4.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrationRequest {
    #[serde(default)]
    pub text: Option<String>,
    /// Text pulled out of an uploaded document; used when `text` is blank.
    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default = "NarrationRequest::default_engine")]
    pub engine: String,
    #[serde(default = "NarrationRequest::default_voice")]
    pub voice: String,
    #[serde(default = "NarrationRequest::default_speed")]
    pub speed: f32,
    #[serde(default = "NarrationRequest::default_align")]
    pub align: bool,
    #[serde(default)]
    pub max_chars: Option<usize>,
    #[serde(default)]
    pub alignment_mode: AlignmentMode,
    #[serde(default)]
    pub reference: Option<ReferenceSource>,
    #[serde(default)]
    pub format: StreamEncoding,
}

impl NarrationRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            extracted_text: None,
            engine: Self::default_engine(),
            voice: Self::default_voice(),
            speed: Self::default_speed(),
            align: Self::default_align(),
            max_chars: None,
            alignment_mode: AlignmentMode::default(),
            reference: None,
            format: StreamEncoding::default(),
        }
    }

    fn default_engine() -> String {
        "auto".into()
    }
    fn default_voice() -> String {
        "af_heart".into()
    }
    fn default_speed() -> f32 {
        1.0
    }
    fn default_align() -> bool {
        true
    }

    /// The first non-blank of `text` and `extracted_text`, trimmed.
    pub fn input_text(&self) -> Option<&str> {
        [self.text.as_deref(), self.extracted_text.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct Narration {
    pub artifacts: NarrationArtifacts,
    pub engine: Engine,
    pub chunks: usize,
    pub cached_chunks: usize,
    pub failed_chunks: Vec<usize>,
    pub stage: AlignStage,
    pub audio_secs: f64,
    pub wall_secs: f64,
}

impl Narration {
    /// Real-time factor: wall time over audio time. Zero for silent output.
    pub fn rtf(&self) -> f64 {
        if self.audio_secs > 0.0 {
            self.wall_secs / self.audio_secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct Package {
    pub bytes: Bytes,
    pub cached: bool,
}

impl Package {
    pub fn file_name(&self) -> &'static str {
        PACKAGE_FILE_NAME
    }

    pub fn content_type(&self) -> &'static str {
        PACKAGE_CONTENT_TYPE
    }
}

pub struct LiveStream {
    pub encoding: StreamEncoding,
    pub sample_rate: u32,
    pub headers: Vec<(String, String)>,
    pub body: ReceiverStream<Bytes>,
    /// Read once `body` is drained to learn whether the stream was cut short.
    pub status: LiveStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub entries: usize,
    pub capacity: usize,
    pub stats: CacheStatsSnapshot,
}

impl CacheReport {
    fn of(cache: &SynthesisCache) -> Self {
        Self {
            entries: cache.len(),
            capacity: cache.capacity(),
            stats: cache.stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub engines: Vec<Engine>,
    pub recommended_engine: Engine,
    pub workers: usize,
    pub workers_idle: usize,
    pub request_cache: CacheReport,
    pub chunk_cache: CacheReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoicesReport {
    pub voices: BTreeMap<Engine, Vec<String>>,
    pub reference_presets: Vec<String>,
}

struct Prepared {
    engine: Engine,
    backend: SharedBackend,
    chunks: Vec<TextChunk>,
    voice: VoiceParams,
}

pub struct NarrationService {
    config: AppConfig,
    registry: BackendRegistry,
    pool: WorkerPool,
    request_cache: Arc<SynthesisCache>,
    orchestrator: SynthesisOrchestrator,
    alignment: AlignmentPipeline,
    references: ReferenceResolver,
    recommended: Engine,
    started_at: DateTime<Utc>,
}

impl NarrationService {
    pub fn new(
        config: AppConfig,
        registry: BackendRegistry,
        aligner: Arc<dyn ForcedAligner>,
    ) -> Result<Self> {
        Self::with_clock(config, registry, aligner, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: AppConfig,
        registry: BackendRegistry,
        aligner: Arc<dyn ForcedAligner>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        ensure!(
            !registry.engines().is_empty(),
            "no synthesis backends configured"
        );

        let pool = WorkerPool::new(config.workers.pool_size);
        let chunk_cache = Arc::new(SynthesisCache::with_clock(
            "chunk",
            config.cache.chunk_capacity,
            config.cache.ttl(),
            clock.clone(),
        ));
        let request_cache = Arc::new(SynthesisCache::with_clock(
            "request",
            config.cache.request_capacity,
            config.cache.ttl(),
            clock,
        ));
        let orchestrator = SynthesisOrchestrator::new(
            chunk_cache,
            pool.clone(),
            config.audio.failed_chunk_silence_ms,
        );
        let alignment = AlignmentPipeline::new(aligner, &config.alignment);
        let references = ReferenceResolver::new(config.reference.clone(), pool.clone())?;
        let recommended = recommend_engine(&config.system);

        Ok(Self {
            config,
            registry,
            pool,
            request_cache,
            orchestrator,
            alignment,
            references,
            recommended,
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Background TTL sweeps for both cache levels.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let interval = self.config.cache.sweep_interval();
        vec![
            self.orchestrator.cache().spawn_sweeper(interval),
            self.request_cache.spawn_sweeper(interval),
        ]
    }

    /// `auto` (or blank) picks the host recommendation when that engine is
    /// configured, otherwise the first configured one.
    pub fn resolve_engine(&self, name: &str) -> Result<Engine, ServiceError> {
        let name = name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("auto") {
            if self.registry.get(self.recommended).is_some() {
                return Ok(self.recommended);
            }
            return self
                .registry
                .engines()
                .first()
                .copied()
                .ok_or_else(|| ServiceError::UnknownEngine(name.to_string()));
        }

        let engine: Engine = name
            .parse()
            .map_err(|UnknownEngine(name)| ServiceError::UnknownEngine(name))?;
        if self.registry.get(engine).is_none() {
            return Err(ServiceError::UnknownEngine(engine.to_string()));
        }
        Ok(engine)
    }

    fn max_chars(&self, requested: Option<usize>, default: usize) -> Result<usize, ServiceError> {
        let planner = &self.config.planner;
        let Some(max_chars) = requested else {
            return Ok(default);
        };
        if !(planner.min_chars_limit..=planner.max_chars_limit).contains(&max_chars) {
            return Err(ServiceError::invalid(
                "max_chars",
                format!(
                    "{max_chars} is outside {}..={}",
                    planner.min_chars_limit, planner.max_chars_limit
                ),
            ));
        }
        Ok(max_chars)
    }

    /// Checks every request parameter that does not need the text planned,
    /// returning the engine and chunk limit to use.
    fn validate(
        &self,
        request: &NarrationRequest,
        default_max_chars: usize,
    ) -> Result<(Engine, usize), ServiceError> {
        let engine = self.resolve_engine(&request.engine)?;
        if !SPEED_RANGE.contains(&request.speed) {
            return Err(ServiceError::invalid(
                "speed",
                format!(
                    "{} is outside {}..={}",
                    request.speed,
                    SPEED_RANGE.start(),
                    SPEED_RANGE.end()
                ),
            ));
        }
        let max_chars = self.max_chars(request.max_chars, default_max_chars)?;
        Ok((engine, max_chars))
    }

    async fn prepare(
        &self,
        request: &NarrationRequest,
        default_max_chars: usize,
    ) -> Result<Prepared, ServiceError> {
        let text = request.input_text().ok_or(ServiceError::EmptyText)?;
        let (engine, max_chars) = self.validate(request, default_max_chars)?;
        let backend = self
            .registry
            .get(engine)
            .ok_or_else(|| ServiceError::UnknownEngine(engine.to_string()))?;

        let chunks = text::plan(text, max_chars);
        if chunks.is_empty() {
            return Err(ServiceError::EmptyText);
        }

        let mut voice = VoiceParams::new(request.voice.clone(), request.speed);
        if let Some(source) = &request.reference {
            voice.reference = self.references.resolve(source).await;
        }

        debug!(%engine, chunks = chunks.len(), max_chars, "Prepared request");
        Ok(Prepared {
            engine,
            backend,
            chunks,
            voice,
        })
    }

    /// Full pipeline: plan, synthesize, time captions, assemble the WAV.
    pub async fn narrate(&self, request: &NarrationRequest) -> Result<Narration, ServiceError> {
        let started = Instant::now();
        let prepared = self.prepare(request, self.config.planner.max_chars).await?;
        info!(
            engine = %prepared.engine,
            voice = %request.voice,
            speed = request.speed,
            chunks = prepared.chunks.len(),
            "Narrating"
        );

        let output = self
            .orchestrator
            .synthesize(&prepared.backend, &prepared.chunks, &prepared.voice)
            .await?;

        let timeline = self
            .alignment
            .run(
                &prepared.chunks,
                &output.buffers,
                request.align,
                request.alignment_mode,
                self.config.system.tier(),
            )
            .await;
        if timeline.spans.len() != prepared.chunks.len() {
            return Err(anyhow!(
                "caption timing produced {} spans for {} chunks",
                timeline.spans.len(),
                prepared.chunks.len()
            )
            .into());
        }
        let srt = to_srt(&timeline.spans);
        let vtt = srt_to_vtt(&srt);

        let loudness = self
            .config
            .audio
            .normalize
            .then(|| self.config.audio.loudness());
        let buffers = output.buffers;
        let (wav, audio_secs) = self
            .pool
            .run(move || -> Result<(Vec<u8>, f64)> {
                let mut full = concat(&buffers)?;
                if let Some(loudness) = loudness {
                    full = normalize_rms(&full, loudness);
                }
                Ok((encode_wav(&full)?, full.duration_secs()))
            })
            .await??;

        let narration = Narration {
            artifacts: NarrationArtifacts { wav, srt, vtt },
            engine: prepared.engine,
            chunks: prepared.chunks.len(),
            cached_chunks: output.cached,
            failed_chunks: output.failed,
            stage: timeline.stage,
            audio_secs,
            wall_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            engine = %narration.engine,
            chunks = narration.chunks,
            cached = narration.cached_chunks,
            failed = narration.failed_chunks.len(),
            stage = ?narration.stage,
            audio_secs = format!("{:.2}", narration.audio_secs),
            wall_secs = format!("{:.2}", narration.wall_secs),
            rtf = format!("{:.3}", narration.rtf()),
            "Narration complete"
        );
        Ok(narration)
    }

    /// Zipped narration. Whole results are cached per request key unless a
    /// cloning reference is involved, since the key cannot see the reference.
    pub async fn package(&self, request: &NarrationRequest) -> Result<Package, ServiceError> {
        let text = request.input_text().ok_or(ServiceError::EmptyText)?;
        let (engine, _) = self.validate(request, self.config.planner.max_chars)?;
        let params = SynthesisParams {
            engine,
            voice: request.voice.clone(),
            speed: request.speed,
            align: request.align,
        };
        let key = request
            .reference
            .is_none()
            .then(|| CacheKey::for_request(&params, text, self.config.cache.key_text_prefix));

        if let Some(key) = &key {
            if let Some(bytes) = self.request_cache.get(key) {
                info!(%key, size = bytes.len(), "Package served from request cache");
                return Ok(Package {
                    bytes,
                    cached: true,
                });
            }
        }

        let narration = self.narrate(request).await?;
        let artifacts = narration.artifacts;
        let zip = self.pool.run(move || artifacts.to_zip()).await??;
        let bytes = Bytes::from(zip);
        if let Some(key) = key {
            self.request_cache.put(key, bytes.clone());
        }
        Ok(Package {
            bytes,
            cached: false,
        })
    }

    /// Live audio. Validation happens up front; once this returns, synthesis
    /// failures surface as silence or through [`LiveStream::status`].
    pub async fn stream(&self, request: &NarrationRequest) -> Result<LiveStream, ServiceError> {
        let prepared = self
            .prepare(request, self.config.planner.stream_max_chars)
            .await?;
        let sample_rate = prepared.backend.sample_rate();
        let encoding = request.format;
        let streaming = &self.config.streaming;
        info!(
            engine = %prepared.engine,
            chunks = prepared.chunks.len(),
            ?encoding,
            sample_rate,
            "Starting live stream"
        );

        let (frames, status) = LiveFrames::new(
            prepared.backend,
            prepared.chunks,
            prepared.voice,
            streaming.frame_ms,
            self.config.audio.failed_chunk_silence_ms,
        );
        let framer = StreamFramer::from_config(frames, encoding, sample_rate, streaming);
        let body = spawn_framed(framer, &self.pool, streaming.channel_depth).await?;

        Ok(LiveStream {
            encoding,
            sample_rate,
            headers: encoding.headers(sample_rate),
            body,
            status,
        })
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            engines: self.registry.engines(),
            recommended_engine: self.recommended,
            workers: self.pool.size(),
            workers_idle: self.pool.available(),
            request_cache: CacheReport::of(&self.request_cache),
            chunk_cache: CacheReport::of(self.orchestrator.cache()),
        }
    }

    pub fn voices(&self) -> VoicesReport {
        VoicesReport {
            voices: self.registry.voices(),
            reference_presets: self.references.presets(),
        }
    }

    pub fn recommended_engine(&self) -> Engine {
        self.recommended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let request: NarrationRequest = serde_json::from_str(r#"{"text": "Hi."}"#).unwrap();
        assert_eq!(request.engine, "auto");
        assert_eq!(request.voice, "af_heart");
        assert_eq!(request.speed, 1.0);
        assert!(request.align);
        assert_eq!(request.max_chars, None);
        assert_eq!(request.alignment_mode, AlignmentMode::Auto);
        assert_eq!(request.format, StreamEncoding::Wav);
    }

    #[test]
    fn extracted_text_fills_in_for_blank_text() {
        let mut request = NarrationRequest::new("   ");
        assert_eq!(request.input_text(), None);
        request.extracted_text = Some("  From a file. ".into());
        assert_eq!(request.input_text(), Some("From a file."));
        request.text = Some("Typed.".into());
        assert_eq!(request.input_text(), Some("Typed."));
    }

    #[test]
    fn request_with_reference_and_mode() {
        let request: NarrationRequest = serde_json::from_str(
            r#"{"text": "Hi.", "engine": "cosyvoice2", "alignment_mode": "fast",
                "format": "pcm", "reference": {"kind": "preset", "id": "narrator"}}"#,
        )
        .unwrap();
        assert_eq!(request.alignment_mode, AlignmentMode::Fast);
        assert_eq!(request.format, StreamEncoding::Pcm);
        assert!(matches!(
            request.reference,
            Some(ReferenceSource::Preset { ref id }) if id == "narrator"
        ));
    }

    #[test]
    fn rtf_of_silent_output_is_zero() {
        let narration = Narration {
            artifacts: NarrationArtifacts {
                wav: Vec::new(),
                srt: String::new(),
                vtt: String::new(),
            },
            engine: Engine::Kokoro,
            chunks: 0,
            cached_chunks: 0,
            failed_chunks: Vec::new(),
            stage: AlignStage::SimpleTiming,
            audio_secs: 0.0,
            wall_secs: 1.0,
        };
        assert_eq!(narration.rtf(), 0.0);
    }
}
