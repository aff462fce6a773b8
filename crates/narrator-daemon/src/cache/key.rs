use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{synth::SynthesisParams, tts::Engine};

/// Hex length of per-chunk keys.
const CHUNK_KEY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Whole-request key. Only the first `prefix_chars` characters of the text
    /// take part, which keeps keys bounded: two long texts that share that
    /// prefix and every parameter map to the same key and the later request
    /// is answered from the earlier one's result.
    pub fn for_request(params: &SynthesisParams, text: &str, prefix_chars: usize) -> Self {
        let prefix: String = text.chars().take(prefix_chars).collect();
        let material = format!(
            "{}:{}:{}:{}:{}",
            params.engine, params.voice, params.speed, params.align, prefix
        );
        Self(hex_digest(material.as_bytes()))
    }

    /// Per-chunk key over the full chunk text, truncated to a fixed width.
    /// Engines share voice names and rates, so the engine is part of it.
    pub fn for_chunk(
        engine: Engine,
        voice: &str,
        lang_code: &str,
        speed: f32,
        sample_rate: u32,
        text: &str,
    ) -> Self {
        let material = format!("{engine}|{voice}|{lang_code}|{speed}|{sample_rate}|{text}");
        let mut digest = hex_digest(material.as_bytes());
        digest.truncate(CHUNK_KEY_LEN);
        Self(digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SynthesisParams {
        SynthesisParams {
            engine: Engine::Kokoro,
            voice: "af_heart".into(),
            speed: 1.0,
            align: true,
        }
    }

    #[test]
    fn chunk_keys_are_fixed_width_and_deterministic() {
        let kokoro = Engine::Kokoro;
        let a = CacheKey::for_chunk(kokoro, "af_heart", "a", 1.0, 24_000, "Hello.");
        let b = CacheKey::for_chunk(kokoro, "af_heart", "a", 1.0, 24_000, "Hello.");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
        assert_ne!(a, CacheKey::for_chunk(kokoro, "af_heart", "a", 1.1, 24_000, "Hello."));
        assert_ne!(a, CacheKey::for_chunk(kokoro, "af_heart", "a", 1.0, 22_050, "Hello."));
    }

    #[test]
    fn chunk_keys_differ_per_engine() {
        let kokoro = CacheKey::for_chunk(Engine::Kokoro, "af_heart", "a", 1.0, 24_000, "Hello.");
        let cosy = CacheKey::for_chunk(Engine::CosyVoice2, "af_heart", "a", 1.0, 24_000, "Hello.");
        assert_ne!(kokoro, cosy);
    }

    #[test]
    fn request_keys_share_a_prefix_collision() {
        let base = "x".repeat(500);
        let a = CacheKey::for_request(&params(), &format!("{base} tail one"), 500);
        let b = CacheKey::for_request(&params(), &format!("{base} tail two"), 500);
        assert_eq!(a, b);

        let mut other = params();
        other.align = false;
        assert_ne!(a, CacheKey::for_request(&other, &base, 500));
    }
}
