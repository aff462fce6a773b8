//! Voice-cloning reference clips: where they come from and how they are
//! turned into a short, clean prompt.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Url, header::RANGE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::memo::{Memoized, fingerprint};
use crate::{
    audio::{self, AudioBuffer, Loudness},
    config::ReferenceConfig,
    workers::WorkerPool,
};

const PROMPT_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReferenceSource {
    /// A clip shipped in one of the preset directories, by file stem.
    Preset { id: String },
    Url { url: String },
    /// Base64-encoded WAV bytes.
    Upload { data: String },
}

/// Prepared reference audio at 16 kHz.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePrompt {
    pub audio: AudioBuffer,
    pub fingerprint: String,
}

impl ReferencePrompt {
    pub fn new(audio: AudioBuffer) -> Self {
        let fingerprint = fingerprint(&audio);
        Self { audio, fingerprint }
    }
}

pub trait ReferenceEncoder: Send + Sync {
    fn encode(&self, raw: &AudioBuffer) -> Result<ReferencePrompt>;
}

/// Trims leading and trailing silence, caps the length, fades the edges,
/// levels the loudness and pads very short clips.
#[derive(Debug, Clone, Copy)]
pub struct TrimmedReference {
    pub threshold: f32,
    pub max_secs: f32,
    pub min_secs: f32,
    pub fade_samples: usize,
    pub loudness: Loudness,
}

impl Default for TrimmedReference {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            max_secs: 3.2,
            min_secs: 1.0,
            fade_samples: 16,
            loudness: Loudness {
                target_dbfs: -18.0,
                ..Loudness::default()
            },
        }
    }
}

impl ReferenceEncoder for TrimmedReference {
    fn encode(&self, raw: &AudioBuffer) -> Result<ReferencePrompt> {
        ensure!(!raw.is_empty(), "reference clip is empty");
        let mut samples =
            audio::resample_linear(&raw.samples, raw.sample_rate, PROMPT_SAMPLE_RATE);

        let loud = |s: &f32| s.abs() > self.threshold;
        if let (Some(first), Some(last)) = (
            samples.iter().position(loud),
            samples.iter().rposition(loud),
        ) {
            samples = samples[first..=last].to_vec();
        }

        let max_len = (self.max_secs * PROMPT_SAMPLE_RATE as f32) as usize;
        samples.truncate(max_len);

        let fade = self.fade_samples.min(samples.len() / 2);
        let len = samples.len();
        for i in 0..fade {
            let gain = i as f32 / fade as f32;
            samples[i] *= gain;
            samples[len - 1 - i] *= gain;
        }

        let leveled = audio::normalize_rms(
            &AudioBuffer::new(samples, PROMPT_SAMPLE_RATE),
            self.loudness,
        );
        let mut samples = leveled.samples;
        let min_len = (self.min_secs * PROMPT_SAMPLE_RATE as f32) as usize;
        if samples.len() < min_len {
            samples.resize(min_len, 0.0);
        }
        Ok(ReferencePrompt::new(AudioBuffer::new(
            samples,
            PROMPT_SAMPLE_RATE,
        )))
    }
}

/// Resolves a [`ReferenceSource`] to a prepared prompt. Every failure is
/// logged and yields `None`; synthesis then proceeds without cloning.
pub struct ReferenceResolver {
    config: ReferenceConfig,
    http: reqwest::Client,
    encoder: Arc<Memoized<TrimmedReference>>,
    pool: WorkerPool,
}

impl ReferenceResolver {
    pub fn new(config: ReferenceConfig, pool: WorkerPool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            config,
            http,
            encoder: Arc::new(Memoized::new(TrimmedReference::default(), 32)),
            pool,
        })
    }

    pub async fn resolve(&self, source: &ReferenceSource) -> Option<Arc<ReferencePrompt>> {
        match self.try_resolve(source).await {
            Ok(prompt) => Some(prompt),
            Err(err) => {
                warn!(?err, "Reference audio unusable, continuing without it");
                None
            }
        }
    }

    async fn try_resolve(&self, source: &ReferenceSource) -> Result<Arc<ReferencePrompt>> {
        let bytes = match source {
            ReferenceSource::Preset { id } => {
                let path = self
                    .preset_path(id)
                    .with_context(|| format!("unknown reference preset '{id}'"))?;
                tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?
            }
            ReferenceSource::Url { url } => self.fetch(url).await?,
            ReferenceSource::Upload { data } => BASE64
                .decode(data.trim())
                .context("reference upload is not valid base64")?,
        };

        let encoder = Arc::clone(&self.encoder);
        self.pool
            .run(move || {
                let raw = audio::decode_wav(&bytes)?;
                encoder.encode_shared(&raw)
            })
            .await?
    }

    /// Preset ids are bare file stems; anything that looks like a path is rejected.
    pub fn preset_path(&self, id: &str) -> Option<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return None;
        }
        self.config
            .preset_dirs
            .iter()
            .map(|dir| dir.join(format!("{id}.wav")))
            .find(|path| path.is_file())
    }

    pub fn presets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .config
            .preset_dirs
            .iter()
            .filter_map(|dir| std::fs::read_dir(dir).ok())
            .flatten()
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "wav"))
            .filter_map(|path| stem(&path))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Probe, then a ranged read of the head of the file. A body too short to
    /// hold useful audio is refetched in full, still bounded by `max_bytes`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let url = Url::parse(url).context("invalid reference URL")?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("unsupported reference URL scheme '{}'", url.scheme());
        }

        match self
            .http
            .head(url.clone())
            .timeout(self.config.probe_timeout())
            .send()
            .await
        {
            Ok(resp) => debug!(status = %resp.status(), length = ?resp.content_length(), "Probed reference URL"),
            Err(err) => debug!(?err, "Reference probe failed, fetching anyway"),
        }

        let body = self
            .get(url.clone(), Some(self.config.range_bytes), self.config.fetch_timeout())
            .await?;
        if body.len() >= self.config.min_useful_bytes {
            return Ok(body);
        }
        debug!(bytes = body.len(), "Reference body too short, refetching");
        self.get(url, None, self.config.retry_timeout()).await
    }

    async fn get(
        &self,
        url: Url,
        range: Option<u64>,
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>> {
        let mut request = self.http.get(url).timeout(timeout);
        if let Some(bytes) = range.filter(|b| *b > 0) {
            request = request.header(RANGE, format!("bytes=0-{}", bytes - 1));
        }
        let mut response = request.send().await?.error_for_status()?;

        let max = self.config.max_bytes;
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let room = max.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= max {
                break;
            }
        }
        Ok(body)
    }
}

fn stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(dirs: Vec<PathBuf>) -> ReferenceResolver {
        let config = ReferenceConfig {
            preset_dirs: dirs,
            ..ReferenceConfig::default()
        };
        ReferenceResolver::new(config, WorkerPool::new(1)).unwrap()
    }

    #[test]
    fn trims_caps_and_pads() {
        let encoder = TrimmedReference::default();

        let mut samples = vec![0.0; 8_000];
        samples.extend(vec![0.3; 16_000 * 5]);
        samples.extend(vec![0.0; 8_000]);
        let long = encoder
            .encode(&AudioBuffer::new(samples, 16_000))
            .unwrap();
        assert_eq!(long.audio.sample_rate, 16_000);
        assert_eq!(long.audio.len(), 51_200);
        assert_eq!(long.audio.samples[0], 0.0);

        let short = encoder
            .encode(&AudioBuffer::new(vec![0.2; 4_000], 16_000))
            .unwrap();
        assert_eq!(short.audio.len(), 16_000);
        assert_eq!(short.audio.samples[15_999], 0.0);
    }

    #[test]
    fn resamples_to_prompt_rate() {
        let prompt = TrimmedReference::default()
            .encode(&AudioBuffer::new(vec![0.2; 48_000], 48_000))
            .unwrap();
        assert_eq!(prompt.audio.sample_rate, 16_000);
        assert_eq!(prompt.audio.len(), 16_000);
    }

    #[test]
    fn preset_ids_cannot_escape_their_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("narrator.wav"), b"RIFF").unwrap();
        let resolver = resolver(vec![dir.path().to_path_buf()]);

        assert!(resolver.preset_path("narrator").is_some());
        assert!(resolver.preset_path("../narrator").is_none());
        assert!(resolver.preset_path("missing").is_none());
        assert_eq!(resolver.presets(), vec!["narrator".to_string()]);
    }

    #[tokio::test]
    async fn bad_sources_resolve_to_none() {
        let resolver = resolver(Vec::new());
        let sources = [
            ReferenceSource::Preset { id: "nope".into() },
            ReferenceSource::Url {
                url: "file:///etc/passwd".into(),
            },
            ReferenceSource::Upload {
                data: "***".into(),
            },
        ];
        for source in &sources {
            assert!(resolver.resolve(source).await.is_none(), "{source:?}");
        }
    }

    #[tokio::test]
    async fn upload_is_decoded_and_prepared() {
        let wav = audio::encode_wav(&AudioBuffer::new(vec![0.25; 24_000], 24_000)).unwrap();
        let source = ReferenceSource::Upload {
            data: BASE64.encode(wav),
        };
        let prompt = resolver(Vec::new()).resolve(&source).await.unwrap();
        assert_eq!(prompt.audio.sample_rate, 16_000);
        assert_eq!(prompt.audio.len(), 16_000);
    }
}
