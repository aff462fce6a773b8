use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::{
    audio::AudioBuffer,
    text::TextChunk,
    tts::{BackendError, FrameIter, SharedBackend, VoiceParams},
};

/// Shared view of how a live stream ended.
#[derive(Debug, Clone, Default)]
pub struct LiveStatus {
    failure: Arc<Mutex<Option<String>>>,
}

impl LiveStatus {
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    fn fail(&self, reason: String) {
        self.failure.lock().get_or_insert(reason);
    }
}

/// Pulls PCM16 frames chunk by chunk from a backend. Nothing is synthesized
/// until the consumer asks for the next frame. A failing chunk is replaced by
/// silence; running out of accelerator memory ends the stream.
pub struct LiveFrames {
    backend: SharedBackend,
    chunks: VecDeque<TextChunk>,
    voice: VoiceParams,
    frame_ms: u32,
    silence_ms: u64,
    current: Option<FrameIter>,
    current_index: usize,
    status: LiveStatus,
}

impl LiveFrames {
    pub fn new(
        backend: SharedBackend,
        chunks: Vec<TextChunk>,
        voice: VoiceParams,
        frame_ms: u32,
        silence_ms: u64,
    ) -> (Self, LiveStatus) {
        let status = LiveStatus::default();
        let frames = Self {
            backend,
            chunks: chunks.into(),
            voice,
            frame_ms,
            silence_ms,
            current: None,
            current_index: 0,
            status: status.clone(),
        };
        (frames, status)
    }

    fn recover(&mut self, err: BackendError) -> Option<Vec<u8>> {
        self.current = None;
        match err {
            BackendError::ResourceExhausted(reason) => {
                self.backend.degrade();
                error!(chunk = self.current_index, %reason, "Live stream aborted, backend out of memory");
                self.status.fail(reason);
                self.chunks.clear();
                None
            }
            err => {
                warn!(chunk = self.current_index, ?err, "Live chunk failed, substituting silence");
                Some(AudioBuffer::silence(self.backend.sample_rate(), self.silence_ms).to_pcm16())
            }
        }
    }
}

impl Iterator for LiveFrames {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frames) = self.current.as_mut() {
                match frames.next() {
                    Some(Ok(frame)) => return Some(frame),
                    Some(Err(err)) => return self.recover(err),
                    None => self.current = None,
                }
            }

            let chunk = self.chunks.pop_front()?;
            self.current_index = chunk.index;
            match self
                .backend
                .synthesize_streaming(&chunk.text, &self.voice, self.frame_ms)
            {
                Ok(frames) => self.current = Some(frames),
                Err(err) => return self.recover(err),
            }
        }
    }
}
