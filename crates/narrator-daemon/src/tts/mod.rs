mod command;
mod memo;
mod reference;
mod warmup;

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::CommandBackend;
pub use memo::Memoized;
pub use reference::{
    ReferenceEncoder, ReferencePrompt, ReferenceResolver, ReferenceSource, TrimmedReference,
};
pub use warmup::{WarmupHandle, WarmupReport, spawn_warmup};

use crate::{
    audio::{self, AudioBuffer},
    config::{AppConfig, BackendConfig, BackendProvider},
};

pub type SharedBackend = Arc<dyn SpeechBackend>;

/// Lazily produced PCM16 frames. Byte counts are arbitrary, odd included.
pub type FrameIter = Box<dyn Iterator<Item = Result<Vec<u8>, BackendError>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "kokoro")]
    Kokoro,
    #[serde(rename = "cosyvoice2")]
    CosyVoice2,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Kokoro => "kokoro",
            Engine::CosyVoice2 => "cosyvoice2",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown engine '{0}'")]
pub struct UnknownEngine(pub String);

impl FromStr for Engine {
    type Err = UnknownEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kokoro" => Ok(Engine::Kokoro),
            "cosyvoice2" => Ok(Engine::CosyVoice2),
            other => Err(UnknownEngine(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("synthesis failed: {0}")]
    Synthesis(String),
    /// The accelerator ran out of memory. The backend should degrade before the next call.
    #[error("accelerator out of memory: {0}")]
    ResourceExhausted(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for BackendError {
    fn from(err: anyhow::Error) -> Self {
        BackendError::Synthesis(format!("{err:#}"))
    }
}

#[derive(Debug, Clone)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: f32,
    pub reference: Option<Arc<ReferencePrompt>>,
}

impl VoiceParams {
    pub fn new(voice: impl Into<String>, speed: f32) -> Self {
        Self {
            voice: voice.into(),
            speed,
            reference: None,
        }
    }

    /// Voice identity for cache keys; a cloning reference is part of it.
    pub fn cache_identity(&self) -> String {
        match &self.reference {
            Some(reference) => format!("{}#{}", self.voice, reference.fingerprint),
            None => self.voice.clone(),
        }
    }
}

/// A speech synthesis engine. Implementations are CPU or accelerator bound
/// and are only ever called from the worker pool.
pub trait SpeechBackend: Send + Sync {
    fn engine(&self) -> Engine;

    fn sample_rate(&self) -> u32;

    fn lang_code(&self) -> &str;

    fn voices(&self) -> Vec<String>;

    /// Whether [`SpeechBackend::synthesize_batch`] does real batched work.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Whether the engine honours `speed` itself.
    fn native_speed(&self) -> bool {
        false
    }

    fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioBuffer, BackendError>;

    /// One buffer per input text, in input order.
    fn synthesize_batch(
        &self,
        texts: &[String],
        params: &VoiceParams,
    ) -> Result<Vec<AudioBuffer>, BackendError> {
        texts
            .iter()
            .map(|text| self.synthesize(text, params))
            .collect()
    }

    fn synthesize_streaming(
        &self,
        text: &str,
        params: &VoiceParams,
        frame_ms: u32,
    ) -> Result<FrameIter, BackendError> {
        whole_unit_frames(self, text, params, frame_ms)
    }

    /// Switches to a lower-capability execution mode. Returns false when
    /// there is nothing lower to fall back to.
    fn degrade(&self) -> bool {
        false
    }
}

/// Brings a backend result to the backend's declared rate and, for engines
/// without native speed control, applies the resample-pair tempo change.
pub fn conform<B: SpeechBackend + ?Sized>(
    backend: &B,
    buffer: AudioBuffer,
    speed: f32,
) -> Result<AudioBuffer, BackendError> {
    let mut buffer = if buffer.sample_rate != backend.sample_rate() {
        audio::resample(&buffer, backend.sample_rate())?
    } else {
        buffer
    };
    if !backend.native_speed() {
        buffer = audio::change_speed(&buffer, speed)?;
    }
    Ok(buffer)
}

/// Streaming for engines without incremental output: synthesize the unit,
/// then slice it into frames.
pub fn whole_unit_frames<B: SpeechBackend + ?Sized>(
    backend: &B,
    text: &str,
    params: &VoiceParams,
    frame_ms: u32,
) -> Result<FrameIter, BackendError> {
    let buffer = backend.synthesize(text, params)?;
    let buffer = conform(backend, buffer, params.speed)?;
    let frames = audio::pcm16_frames(&buffer, frame_ms);
    Ok(Box::new(frames.into_iter().map(Ok)))
}

/// Deterministic silence sized from the text. Stands in for a real engine in
/// development and tests.
pub struct NullBackend {
    engine: Engine,
    sample_rate: u32,
    lang_code: String,
    voices: Vec<String>,
}

impl NullBackend {
    pub fn new(engine: Engine, sample_rate: u32) -> Self {
        Self {
            engine,
            sample_rate,
            lang_code: "a".into(),
            voices: vec!["af_heart".into()],
        }
    }

    fn from_config(config: &BackendConfig) -> Self {
        Self {
            engine: config.engine,
            sample_rate: config.sample_rate,
            lang_code: config.lang_code.clone(),
            voices: config.voices.clone(),
        }
    }
}

impl SpeechBackend for NullBackend {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn lang_code(&self) -> &str {
        &self.lang_code
    }

    fn voices(&self) -> Vec<String> {
        self.voices.clone()
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn native_speed(&self) -> bool {
        true
    }

    fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioBuffer, BackendError> {
        let seconds = (text.chars().count() as f32 / 14.0).clamp(0.5, 30.0) / params.speed.max(0.1);
        Ok(AudioBuffer::silence(
            self.sample_rate,
            (seconds * 1000.0) as u64,
        ))
    }
}

/// Backends keyed by engine.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<Engine, SharedBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, backend: SharedBackend) {
        self.backends.insert(backend.engine(), backend);
    }

    pub fn with(mut self, backend: SharedBackend) -> Self {
        self.insert(backend);
        self
    }

    pub fn get(&self, engine: Engine) -> Option<SharedBackend> {
        self.backends.get(&engine).cloned()
    }

    pub fn engines(&self) -> Vec<Engine> {
        self.backends.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedBackend> {
        self.backends.values()
    }

    pub fn voices(&self) -> BTreeMap<Engine, Vec<String>> {
        self.backends
            .iter()
            .map(|(engine, backend)| (*engine, backend.voices()))
            .collect()
    }
}

pub fn create_backend(config: &BackendConfig) -> SharedBackend {
    match &config.provider {
        BackendProvider::Null => Arc::new(NullBackend::from_config(config)),
        BackendProvider::Command { .. } => Arc::new(CommandBackend::from_config(config)),
    }
}

pub fn create_backends(config: &AppConfig) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    for backend in &config.backends {
        registry.insert(create_backend(backend));
    }
    registry
}
