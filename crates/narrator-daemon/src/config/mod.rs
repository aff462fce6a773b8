use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::capability::SystemCapabilities;
use crate::tts::Engine;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub alignment: AlignmentConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub system: SystemCapabilities,
    #[serde(default = "AppConfig::default_backends")]
    pub backends: Vec<BackendConfig>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        if let Ok(path) = env::var("NARRATOR_CONFIG") {
            return Self::from_path(Path::new(&path));
        }

        let project_root = env::var("NARRATOR_ROOT").unwrap_or_else(|_| ".".to_string());
        let default_path = Path::new(&project_root).join("config/narrator.toml");
        if default_path.exists() {
            return Self::from_path(&default_path);
        }

        let example_path = Path::new(&project_root).join("config/narrator.example.toml");
        if example_path.exists() {
            tracing::warn!("Using example configuration at {:?}", example_path);
            return Self::from_path(&example_path);
        }

        Ok(Self::with_default_backends())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml(&contents).with_context(|| format!("invalid config: {:?}", path))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    /// Defaults plus the built-in null backends, so a bare daemon can serve requests.
    pub fn with_default_backends() -> Self {
        Self {
            backends: Self::default_backends(),
            ..Self::default()
        }
    }

    fn default_backends() -> Vec<BackendConfig> {
        vec![
            BackendConfig::null(Engine::Kokoro, 24_000),
            BackendConfig::null(Engine::CosyVoice2, 24_000),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "BridgeConfig::default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "BridgeConfig::default_max_clients")]
    pub max_clients: usize,
}

impl BridgeConfig {
    fn default_listen_addr() -> String {
        "127.0.0.1:7878".into()
    }
    fn default_max_clients() -> usize {
        16
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            max_clients: Self::default_max_clients(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "PlannerConfig::default_max_chars")]
    pub max_chars: usize,
    /// Smaller units get the first audio out sooner on live streams.
    #[serde(default = "PlannerConfig::default_stream_max_chars")]
    pub stream_max_chars: usize,
    #[serde(default = "PlannerConfig::default_min_chars_limit")]
    pub min_chars_limit: usize,
    #[serde(default = "PlannerConfig::default_max_chars_limit")]
    pub max_chars_limit: usize,
}

impl PlannerConfig {
    fn default_max_chars() -> usize {
        240
    }
    fn default_stream_max_chars() -> usize {
        120
    }
    fn default_min_chars_limit() -> usize {
        12
    }
    fn default_max_chars_limit() -> usize {
        2000
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_chars: Self::default_max_chars(),
            stream_max_chars: Self::default_stream_max_chars(),
            min_chars_limit: Self::default_min_chars_limit(),
            max_chars_limit: Self::default_max_chars_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_request_capacity")]
    pub request_capacity: usize,
    #[serde(default = "CacheConfig::default_chunk_capacity")]
    pub chunk_capacity: usize,
    #[serde(default = "CacheConfig::default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "CacheConfig::default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Characters of request text that feed the whole-request key.
    #[serde(default = "CacheConfig::default_key_text_prefix")]
    pub key_text_prefix: usize,
}

impl CacheConfig {
    fn default_request_capacity() -> usize {
        50
    }
    fn default_chunk_capacity() -> usize {
        512
    }
    fn default_ttl_secs() -> u64 {
        3600
    }
    fn default_sweep_interval_secs() -> u64 {
        300
    }
    fn default_key_text_prefix() -> usize {
        500
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            request_capacity: Self::default_request_capacity(),
            chunk_capacity: Self::default_chunk_capacity(),
            ttl_secs: Self::default_ttl_secs(),
            sweep_interval_secs: Self::default_sweep_interval_secs(),
            key_text_prefix: Self::default_key_text_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_pool_size")]
    pub pool_size: usize,
}

impl WorkerConfig {
    fn default_pool_size() -> usize {
        4
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: Self::default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "AudioConfig::default_normalize")]
    pub normalize: bool,
    #[serde(default = "AudioConfig::default_target_dbfs")]
    pub target_dbfs: f32,
    #[serde(default = "AudioConfig::default_min_gain")]
    pub min_gain: f32,
    #[serde(default = "AudioConfig::default_max_gain")]
    pub max_gain: f32,
    /// Silence substituted for a chunk whose synthesis failed.
    #[serde(default = "AudioConfig::default_failed_chunk_silence_ms")]
    pub failed_chunk_silence_ms: u64,
}

impl AudioConfig {
    fn default_normalize() -> bool {
        false
    }
    fn default_target_dbfs() -> f32 {
        -20.0
    }
    fn default_min_gain() -> f32 {
        0.25
    }
    fn default_max_gain() -> f32 {
        8.0
    }
    fn default_failed_chunk_silence_ms() -> u64 {
        500
    }

    pub fn loudness(&self) -> crate::audio::Loudness {
        crate::audio::Loudness {
            target_dbfs: self.target_dbfs,
            min_gain: self.min_gain,
            max_gain: self.max_gain,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            normalize: Self::default_normalize(),
            target_dbfs: Self::default_target_dbfs(),
            min_gain: Self::default_min_gain(),
            max_gain: Self::default_max_gain(),
            failed_chunk_silence_ms: Self::default_failed_chunk_silence_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlignmentConfig {
    /// Aligner executable plus leading arguments, e.g. `["conda", "run", "-n", "aligner", "mfa"]`.
    #[serde(default = "AlignmentConfig::default_command")]
    pub command: Vec<String>,
    #[serde(default = "AlignmentConfig::default_dictionary")]
    pub dictionary: String,
    #[serde(default = "AlignmentConfig::default_acoustic_model")]
    pub acoustic_model: String,
    #[serde(default = "AlignmentConfig::default_max_jobs")]
    pub max_jobs: usize,
    #[serde(default = "AlignmentConfig::default_single_speaker")]
    pub single_speaker: bool,
    /// Character budget for forced alignment on a standard-tier host.
    #[serde(default = "AlignmentConfig::default_standard_threshold")]
    pub standard_threshold: usize,
    #[serde(default = "AlignmentConfig::default_high_threshold")]
    pub high_threshold: usize,
    /// No limit when unset; the aligner runs until it exits.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl AlignmentConfig {
    fn default_command() -> Vec<String> {
        vec!["mfa".into()]
    }
    fn default_dictionary() -> String {
        "english_us_arpa".into()
    }
    fn default_acoustic_model() -> String {
        "english_mfa".into()
    }
    fn default_max_jobs() -> usize {
        8
    }
    fn default_single_speaker() -> bool {
        true
    }
    fn default_standard_threshold() -> usize {
        300
    }
    fn default_high_threshold() -> usize {
        1000
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn num_jobs(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        cores.min(self.max_jobs).max(1)
    }
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            command: Self::default_command(),
            dictionary: Self::default_dictionary(),
            acoustic_model: Self::default_acoustic_model(),
            max_jobs: Self::default_max_jobs(),
            single_speaker: Self::default_single_speaker(),
            standard_threshold: Self::default_standard_threshold(),
            high_threshold: Self::default_high_threshold(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "StreamingConfig::default_wav_prime_ms")]
    pub wav_prime_ms: u32,
    #[serde(default = "StreamingConfig::default_pcm_prime_ms")]
    pub pcm_prime_ms: u32,
    #[serde(default = "StreamingConfig::default_prebuffer_frames")]
    pub prebuffer_frames: usize,
    #[serde(default = "StreamingConfig::default_frame_ms")]
    pub frame_ms: u32,
    /// Blocks queued between the synthesis worker and the socket writer.
    #[serde(default = "StreamingConfig::default_channel_depth")]
    pub channel_depth: usize,
}

impl StreamingConfig {
    fn default_wav_prime_ms() -> u32 {
        80
    }
    fn default_pcm_prime_ms() -> u32 {
        120
    }
    fn default_prebuffer_frames() -> usize {
        3
    }
    fn default_frame_ms() -> u32 {
        30
    }
    fn default_channel_depth() -> usize {
        32
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            wav_prime_ms: Self::default_wav_prime_ms(),
            pcm_prime_ms: Self::default_pcm_prime_ms(),
            prebuffer_frames: Self::default_prebuffer_frames(),
            frame_ms: Self::default_frame_ms(),
            channel_depth: Self::default_channel_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceConfig {
    #[serde(default = "ReferenceConfig::default_preset_dirs")]
    pub preset_dirs: Vec<PathBuf>,
    #[serde(default = "ReferenceConfig::default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "ReferenceConfig::default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "ReferenceConfig::default_retry_timeout_secs")]
    pub retry_timeout_secs: u64,
    #[serde(default = "ReferenceConfig::default_range_bytes")]
    pub range_bytes: u64,
    #[serde(default = "ReferenceConfig::default_max_bytes")]
    pub max_bytes: usize,
    /// Bodies shorter than this are treated as truncated and refetched.
    #[serde(default = "ReferenceConfig::default_min_useful_bytes")]
    pub min_useful_bytes: usize,
    #[serde(default = "ReferenceConfig::default_user_agent")]
    pub user_agent: String,
}

impl ReferenceConfig {
    fn default_preset_dirs() -> Vec<PathBuf> {
        vec![PathBuf::from("data/refs")]
    }
    fn default_probe_timeout_secs() -> u64 {
        8
    }
    fn default_fetch_timeout_secs() -> u64 {
        15
    }
    fn default_retry_timeout_secs() -> u64 {
        20
    }
    fn default_range_bytes() -> u64 {
        1024 * 1024
    }
    fn default_max_bytes() -> usize {
        2 * 1024 * 1024
    }
    fn default_min_useful_bytes() -> usize {
        8192
    }
    fn default_user_agent() -> String {
        concat!("narrator-daemon/", env!("CARGO_PKG_VERSION")).into()
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            preset_dirs: Self::default_preset_dirs(),
            probe_timeout_secs: Self::default_probe_timeout_secs(),
            fetch_timeout_secs: Self::default_fetch_timeout_secs(),
            retry_timeout_secs: Self::default_retry_timeout_secs(),
            range_bytes: Self::default_range_bytes(),
            max_bytes: Self::default_max_bytes(),
            min_useful_bytes: Self::default_min_useful_bytes(),
            user_agent: Self::default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub engine: Engine,
    #[serde(default = "BackendConfig::default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "BackendConfig::default_lang_code")]
    pub lang_code: String,
    #[serde(default = "BackendConfig::default_voices")]
    pub voices: Vec<String>,
    pub provider: BackendProvider,
}

impl BackendConfig {
    fn default_sample_rate() -> u32 {
        24_000
    }
    fn default_lang_code() -> String {
        "a".into()
    }
    fn default_voices() -> Vec<String> {
        vec!["af_heart".into()]
    }

    pub fn null(engine: Engine, sample_rate: u32) -> Self {
        Self {
            engine,
            sample_rate,
            lang_code: Self::default_lang_code(),
            voices: Self::default_voices(),
            provider: BackendProvider::Null,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum BackendProvider {
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "command")]
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Extra arguments appended once the backend has degraded to CPU execution.
        #[serde(default)]
        cpu_args: Vec<String>,
        /// Arguments for a raw s16le stdout mode; streaming falls back to whole-unit synthesis when unset.
        #[serde(default)]
        stream_args: Option<Vec<String>>,
        #[serde(default)]
        batch: bool,
        #[serde(default)]
        native_speed: bool,
    },
}
