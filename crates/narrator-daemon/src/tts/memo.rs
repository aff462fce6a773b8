use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::reference::{ReferenceEncoder, ReferencePrompt};
use crate::audio::AudioBuffer;

/// Samples that feed the fingerprint. Longer clips only add their length.
const FINGERPRINT_SAMPLES: usize = 262_144;

/// Caches encoder output per distinct input clip, so repeated requests with
/// the same reference skip feature extraction.
pub struct Memoized<E> {
    inner: E,
    capacity: usize,
    entries: Mutex<Entries>,
}

/// Prompts keyed by fingerprint, each with the tick of its last use.
#[derive(Default)]
struct Entries {
    tick: u64,
    prompts: HashMap<String, (Arc<ReferencePrompt>, u64)>,
}

impl Entries {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

impl<E: ReferenceEncoder> Memoized<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn encode_shared(&self, raw: &AudioBuffer) -> Result<Arc<ReferencePrompt>> {
        let key = fingerprint(raw);
        {
            let mut entries = self.entries.lock();
            let tick = entries.next_tick();
            if let Some((hit, used)) = entries.prompts.get_mut(&key) {
                *used = tick;
                return Ok(Arc::clone(hit));
            }
        }

        let mut prompt = self.inner.encode(raw)?;
        prompt.fingerprint = key.clone();
        let prompt = Arc::new(prompt);

        let mut entries = self.entries.lock();
        if !entries.prompts.contains_key(&key) && entries.prompts.len() >= self.capacity {
            let oldest = entries
                .prompts
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.prompts.remove(&oldest);
            }
        }
        let tick = entries.next_tick();
        entries.prompts.insert(key, (Arc::clone(&prompt), tick));
        debug!(cached = entries.prompts.len(), "Memoized reference features");
        Ok(prompt)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: ReferenceEncoder> ReferenceEncoder for Memoized<E> {
    fn encode(&self, raw: &AudioBuffer) -> Result<ReferencePrompt> {
        let shared = self.encode_shared(raw)?;
        Ok((*shared).clone())
    }
}

pub fn fingerprint(raw: &AudioBuffer) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.sample_rate.to_le_bytes());
    hasher.update((raw.len() as u64).to_le_bytes());
    for sample in raw.samples.iter().take(FINGERPRINT_SAMPLES) {
        hasher.update(sample.to_le_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingEncoder {
        calls: AtomicUsize,
    }

    impl ReferenceEncoder for CountingEncoder {
        fn encode(&self, raw: &AudioBuffer) -> Result<ReferencePrompt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReferencePrompt::new(raw.clone()))
        }
    }

    #[test]
    fn same_clip_is_encoded_once() {
        let memo = Memoized::new(CountingEncoder::default(), 4);
        let clip = AudioBuffer::new(vec![0.1, 0.2, 0.3], 16_000);

        let first = memo.encode_shared(&clip).unwrap();
        let second = memo.encode_shared(&clip.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.fingerprint.len(), 16);

        memo.encode_shared(&AudioBuffer::new(vec![0.1, 0.2], 16_000))
            .unwrap();
        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stays_within_capacity() {
        let memo = Memoized::new(CountingEncoder::default(), 2);
        for n in 0..5 {
            memo.encode_shared(&AudioBuffer::new(vec![n as f32; 8], 16_000))
                .unwrap();
        }
        assert_eq!(memo.len(), 2);
    }

    #[test]
    fn least_recently_used_clip_is_evicted() {
        let memo = Memoized::new(CountingEncoder::default(), 2);
        let clip = |n: f32| AudioBuffer::new(vec![n; 8], 16_000);

        memo.encode_shared(&clip(1.0)).unwrap();
        memo.encode_shared(&clip(2.0)).unwrap();
        // Touch the first so the second becomes the oldest.
        memo.encode_shared(&clip(1.0)).unwrap();
        memo.encode_shared(&clip(3.0)).unwrap();
        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 3);

        memo.encode_shared(&clip(1.0)).unwrap();
        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 3);
        memo.encode_shared(&clip(2.0)).unwrap();
        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn encoder_trait_hands_out_memoized_copies() {
        let memo = Memoized::new(CountingEncoder::default(), 4);
        let clip = AudioBuffer::new(vec![0.4; 16], 16_000);

        let first = ReferenceEncoder::encode(&memo, &clip).unwrap();
        let second = ReferenceEncoder::encode(&memo, &clip).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fingerprint, fingerprint(&clip));
        assert_eq!(memo.inner.calls.load(Ordering::SeqCst), 1);
    }
}
