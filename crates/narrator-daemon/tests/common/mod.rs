#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use narrator_daemon::{
    alignment::{AlignError, ForcedAligner, UtteranceBounds},
    audio::AudioBuffer,
    cache::Clock,
    config::AppConfig,
    service::NarrationService,
    text::TextChunk,
    tts::{BackendError, BackendRegistry, Engine, SpeechBackend, VoiceParams},
};

pub const SAMPLE_RATE: u32 = 8_000;
pub const SAMPLES_PER_CHAR: usize = 100;

/// Constant-amplitude output proportional to the text. Chunks containing
/// `FAIL` error, chunks containing `OOM` report accelerator exhaustion.
pub struct FakeBackend {
    pub engine: Engine,
    pub amplitude: f32,
    pub calls: AtomicUsize,
    pub degraded: AtomicUsize,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new(Engine::Kokoro, 0.1)
    }
}

impl FakeBackend {
    pub fn new(engine: Engine, amplitude: f32) -> Self {
        Self {
            engine,
            amplitude,
            calls: AtomicUsize::new(0),
            degraded: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpeechBackend for FakeBackend {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn lang_code(&self) -> &str {
        "a"
    }

    fn voices(&self) -> Vec<String> {
        vec!["af_heart".into(), "am_adam".into()]
    }

    fn native_speed(&self) -> bool {
        true
    }

    fn synthesize(&self, text: &str, _params: &VoiceParams) -> Result<AudioBuffer, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("FAIL") {
            return Err(BackendError::Synthesis("scripted failure".into()));
        }
        if text.contains("OOM") {
            return Err(BackendError::ResourceExhausted("CUDA out of memory".into()));
        }
        let samples = vec![self.amplitude; text.chars().count() * SAMPLES_PER_CHAR];
        Ok(AudioBuffer::new(samples, SAMPLE_RATE))
    }

    fn degrade(&self) -> bool {
        self.degraded.fetch_add(1, Ordering::SeqCst) == 0
    }
}

/// Reports each utterance as spoken from 10 ms in to 10 ms before its end.
#[derive(Default)]
pub struct FakeAligner {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl FakeAligner {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ForcedAligner for FakeAligner {
    async fn align(
        &self,
        _chunks: &[TextChunk],
        buffers: &[AudioBuffer],
    ) -> Result<Vec<UtteranceBounds>, AlignError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AlignError::NotFound("mfa".into()));
        }
        Ok(buffers
            .iter()
            .map(|buffer| UtteranceBounds {
                start_secs: 0.01,
                end_secs: (buffer.duration_secs() - 0.01).max(0.01),
            })
            .collect())
    }
}

pub struct Harness {
    pub service: Arc<NarrationService>,
    pub backend: Arc<FakeBackend>,
    pub aligner: Arc<FakeAligner>,
}

pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.workers.pool_size = 2;
    config
}

pub fn harness() -> Harness {
    harness_with(config(), FakeAligner::default(), None)
}

pub fn harness_with(config: AppConfig, aligner: FakeAligner, clock: Option<Arc<dyn Clock>>) -> Harness {
    let backend = Arc::new(FakeBackend::default());
    let aligner = Arc::new(aligner);
    let registry = BackendRegistry::new().with(backend.clone());
    let service = match clock {
        Some(clock) => NarrationService::with_clock(config, registry, aligner.clone(), clock),
        None => NarrationService::new(config, registry, aligner.clone()),
    }
    .unwrap();
    Harness {
        service: Arc::new(service),
        backend,
        aligner,
    }
}

/// `(start_ms, end_ms)` of every SRT cue.
pub fn cue_times(srt: &str) -> Vec<(u64, u64)> {
    srt.lines()
        .filter_map(|line| line.split_once(" --> "))
        .map(|(start, end)| (parse_timestamp(start), parse_timestamp(end)))
        .collect()
}

fn parse_timestamp(stamp: &str) -> u64 {
    let (clock, millis) = stamp.trim().split_once([',', '.']).unwrap();
    let parts: Vec<u64> = clock.split(':').map(|p| p.parse().unwrap()).collect();
    ((parts[0] * 60 + parts[1]) * 60 + parts[2]) * 1000 + millis.parse::<u64>().unwrap()
}
