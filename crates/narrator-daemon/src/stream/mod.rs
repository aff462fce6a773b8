//! Live audio framing. The framer is a plain iterator; [`spawn_framed`]
//! drives one on the worker pool and hands blocks to async consumers over a
//! bounded channel, so a slow reader throttles synthesis.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{audio::wav_stream_header, config::StreamingConfig, workers::WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEncoding {
    /// RIFF/WAV with an open-ended length.
    #[default]
    Wav,
    /// Headerless s16le mono.
    Pcm,
}

impl StreamEncoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            StreamEncoding::Wav => "audio/wav",
            StreamEncoding::Pcm => "audio/L16",
        }
    }

    /// Response metadata. Raw PCM carries no header, so its layout travels here.
    pub fn headers(&self, sample_rate: u32) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Content-Type".to_string(), self.content_type().to_string()),
            ("Cache-Control".to_string(), "no-store".to_string()),
        ];
        if *self == StreamEncoding::Pcm {
            headers.push((
                "X-Audio-Format".to_string(),
                format!("s16le; rate={sample_rate}; channels=1"),
            ));
        }
        headers
    }

    pub fn prime_ms(&self, config: &StreamingConfig) -> u32 {
        match self {
            StreamEncoding::Wav => config.wav_prime_ms,
            StreamEncoding::Pcm => config.pcm_prime_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Prime,
    Prebuffer,
    Body,
    Tail,
    Done,
}

/// Turns raw PCM16 frames of any byte length into transport blocks:
/// optional header, priming silence, one prebuffered block, then the rest.
/// Every block has even length; an odd trailing byte waits for the next
/// frame and is zero-padded at the very end.
pub struct StreamFramer<I> {
    frames: I,
    encoding: StreamEncoding,
    sample_rate: u32,
    prime_ms: u32,
    prebuffer_frames: usize,
    carry: Option<u8>,
    stage: Stage,
}

impl<I> StreamFramer<I>
where
    I: Iterator<Item = Vec<u8>>,
{
    pub fn new(
        frames: I,
        encoding: StreamEncoding,
        sample_rate: u32,
        prime_ms: u32,
        prebuffer_frames: usize,
    ) -> Self {
        Self {
            frames,
            encoding,
            sample_rate,
            prime_ms,
            prebuffer_frames,
            carry: None,
            stage: Stage::Header,
        }
    }

    pub fn from_config(
        frames: I,
        encoding: StreamEncoding,
        sample_rate: u32,
        config: &StreamingConfig,
    ) -> Self {
        Self::new(
            frames,
            encoding,
            sample_rate,
            encoding.prime_ms(config),
            config.prebuffer_frames,
        )
    }

    /// Prefixes any carried byte and holds back a new odd one.
    fn align(&mut self, frame: &[u8]) -> Vec<u8> {
        let mut block = Vec::with_capacity(frame.len() + 1);
        block.extend(self.carry.take());
        block.extend_from_slice(frame);
        if block.len() % 2 == 1 {
            self.carry = block.pop();
        }
        block
    }

    fn prime_block(&self) -> Vec<u8> {
        let bytes = (self.sample_rate as u64 * 2 * self.prime_ms as u64 / 1000) as usize;
        vec![0; bytes & !1]
    }
}

impl<I> Iterator for StreamFramer<I>
where
    I: Iterator<Item = Vec<u8>>,
{
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        loop {
            match self.stage {
                Stage::Header => {
                    self.stage = Stage::Prime;
                    if self.encoding == StreamEncoding::Wav {
                        return Some(Bytes::from(wav_stream_header(self.sample_rate)));
                    }
                }
                Stage::Prime => {
                    self.stage = Stage::Prebuffer;
                    let prime = self.prime_block();
                    if !prime.is_empty() {
                        return Some(Bytes::from(prime));
                    }
                }
                Stage::Prebuffer => {
                    self.stage = Stage::Body;
                    let mut combined = Vec::new();
                    let mut exhausted = false;
                    for _ in 0..self.prebuffer_frames {
                        match self.frames.next() {
                            Some(frame) => {
                                let aligned = self.align(&frame);
                                combined.extend_from_slice(&aligned);
                            }
                            None => {
                                exhausted = true;
                                break;
                            }
                        }
                    }
                    if exhausted {
                        self.stage = Stage::Tail;
                    }
                    if !combined.is_empty() {
                        return Some(Bytes::from(combined));
                    }
                }
                Stage::Body => match self.frames.next() {
                    Some(frame) => {
                        let block = self.align(&frame);
                        if !block.is_empty() {
                            return Some(Bytes::from(block));
                        }
                    }
                    None => self.stage = Stage::Tail,
                },
                Stage::Tail => {
                    self.stage = Stage::Done;
                    if let Some(byte) = self.carry.take() {
                        return Some(Bytes::from(vec![byte, 0]));
                    }
                }
                Stage::Done => return None,
            }
        }
    }
}

/// Runs a block iterator on the worker pool, feeding a bounded channel.
/// Dropping the returned stream stops the producer at its next send.
pub async fn spawn_framed<I>(
    blocks: I,
    pool: &WorkerPool,
    depth: usize,
) -> anyhow::Result<ReceiverStream<Bytes>>
where
    I: Iterator<Item = Bytes> + Send + 'static,
{
    let permit = pool.acquire().await?;
    let (tx, rx) = mpsc::channel(depth.max(1));
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let mut sent = 0usize;
        for block in blocks {
            sent += block.len();
            if tx.blocking_send(block).is_err() {
                debug!(sent, "Stream consumer went away, stopping synthesis");
                return;
            }
        }
        debug!(sent, "Stream finished");
    });
    Ok(ReceiverStream::new(rx))
}
