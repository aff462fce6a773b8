//! Splitting long-form text into bounded synthesis units.

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
}

impl TextChunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Greedily packs whole sentences into chunks of at most `max_chars`
/// characters. A sentence longer than the limit is kept intact as its own
/// chunk rather than being cut mid-sentence. Whitespace-only input yields
/// no chunks; callers report that as an input error.
pub fn plan(text: &str, max_chars: usize) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_len = 0usize;

    for sentence in sentences(text) {
        let len = sentence.chars().count();
        if buf.is_empty() {
            buf = sentence;
            buf_len = len;
        } else if buf_len + 1 + len <= max_chars {
            buf.push(' ');
            buf.push_str(&sentence);
            buf_len += 1 + len;
        } else {
            chunks.push(std::mem::replace(&mut buf, sentence));
            buf_len = len;
        }
    }
    if !buf.is_empty() {
        chunks.push(buf);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextChunk { index, text })
        .collect()
}

/// UAX #29 sentence boundaries, trimmed, empties dropped.
pub fn sentences(text: &str) -> Vec<String> {
    text.unicode_sentences()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn total_chars(chunks: &[TextChunk]) -> usize {
    chunks.iter().map(TextChunk::char_len).sum()
}
