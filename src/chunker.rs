//! Splits input text into bounded, boundary-aware chunks with exact offsets.
//!
//! All positions are char (Unicode scalar value) indices into the original
//! text. Cuts are placed on grapheme cluster boundaries, preferring, in order:
//! a paragraph break, the end of a sentence, any whitespace. If none is found
//! within the lookback window the chunk is cut hard at `max_chunk_size`.

use ropey::Rope;
use serde::{Deserialize, Serialize};
use tracing::debug;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::ValidationError;

pub const DEFAULT_MIN_TEXT_CHARS: usize = 10;
pub const DEFAULT_MAX_TEXT_CHARS: usize = 100_000;

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '…', ';'];

/// Inclusive character-count bounds accepted for a single input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBounds {
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for TextBounds {
    fn default() -> Self {
        Self {
            min_chars: DEFAULT_MIN_TEXT_CHARS,
            max_chars: DEFAULT_MAX_TEXT_CHARS,
        }
    }
}

impl TextBounds {
    /// Returns the text's length in chars when it is acceptable.
    pub fn check(&self, text: &str) -> Result<usize, ValidationError> {
        if text.trim().is_empty() {
            return Err(ValidationError::Empty);
        }
        let chars = text.chars().count();
        if chars < self.min_chars {
            return Err(ValidationError::TooShort {
                chars,
                min: self.min_chars,
            });
        }
        if chars > self.max_chars {
            return Err(ValidationError::TooLong {
                chars,
                max: self.max_chars,
            });
        }
        Ok(chars)
    }
}

/// A contiguous window into the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    /// Char position in the original text that local offset 0 maps to.
    pub start_offset: usize,
    /// Leading chars shared with the previous chunk (0 without overlap).
    pub overlap: usize,
    char_len: usize,
}

impl Chunk {
    pub fn len_chars(&self) -> usize {
        self.char_len
    }

    pub fn end_offset(&self) -> usize {
        self.start_offset + self.char_len
    }

    /// The part of this chunk not already covered by its predecessor.
    pub fn fresh_text(&self) -> &str {
        match self.text.char_indices().nth(self.overlap) {
            Some((byte, _)) => &self.text[byte..],
            None => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    max_chunk_size: usize,
    overlap: usize,
    lookback: usize,
    bounds: TextBounds,
}

impl Chunker {
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            max_chunk_size,
            overlap: 0,
            lookback: (max_chunk_size / 4).max(1),
            bounds: TextBounds::default(),
        }
    }

    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }

    /// How far back from the hard cut to search for a semantic boundary.
    pub fn with_lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback.max(1);
        self
    }

    pub fn with_bounds(mut self, bounds: TextBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn chunk(&self, text: &str) -> Result<Vec<Chunk>, ValidationError> {
        if self.max_chunk_size == 0 {
            return Err(ValidationError::ZeroChunkSize);
        }
        self.bounds.check(text)?;

        let rope = Rope::from_str(text);
        let len = rope.len_chars();
        let boundaries = grapheme_boundaries(text, len);
        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut overlap = 0usize;

        loop {
            let end = if len - start <= self.max_chunk_size {
                len
            } else {
                self.cut_point(&rope, &boundaries, start)
            };
            chunks.push(Chunk {
                index: chunks.len(),
                text: rope.slice(start..end).to_string(),
                start_offset: start,
                overlap,
                char_len: end - start,
            });
            if end == len {
                break;
            }

            let next = self.next_start(&boundaries, start, end);
            overlap = end - next;
            start = next;
        }

        debug!(
            chunks = chunks.len(),
            max_chunk_size = self.max_chunk_size,
            overlap = self.overlap,
            "chunked text"
        );
        Ok(chunks)
    }

    fn cut_point(&self, rope: &Rope, boundaries: &[bool], start: usize) -> usize {
        let hard = start + self.max_chunk_size;
        let floor = hard.saturating_sub(self.lookback).max(start + 1);

        let candidates = || (floor..=hard).rev().filter(move |&p| boundaries[p]);

        if let Some(p) = candidates().find(|&p| is_paragraph_break(rope, p, start)) {
            return p;
        }
        if let Some(p) = candidates().find(|&p| is_sentence_end(rope, p, start)) {
            return p;
        }
        if let Some(p) = candidates().find(|&p| rope.char(p - 1).is_whitespace()) {
            return p;
        }
        // Hard cut: largest grapheme boundary that keeps the chunk non-empty.
        if let Some(p) = ((start + 1)..=hard).rev().find(|&p| boundaries[p]) {
            return p;
        }
        debug!(start, hard, "grapheme cluster longer than max_chunk_size, cutting inside it");
        hard
    }

    fn next_start(&self, boundaries: &[bool], start: usize, end: usize) -> usize {
        if self.overlap == 0 {
            return end;
        }
        let wanted = end.saturating_sub(self.overlap);
        (start + 1..=wanted)
            .rev()
            .find(|&p| boundaries[p])
            .unwrap_or(end)
    }
}

/// Validates then chunks with default bounds, no overlap and default lookback.
pub fn chunk(text: &str, max_chunk_size: usize) -> Result<Vec<Chunk>, ValidationError> {
    Chunker::new(max_chunk_size).chunk(text)
}

/// `out[i]` is true when char index `i` starts a grapheme cluster (or is the end).
fn grapheme_boundaries(text: &str, len: usize) -> Vec<bool> {
    let mut out = vec![false; len + 1];
    let mut position = 0usize;
    for grapheme in text.graphemes(true) {
        out[position] = true;
        position += grapheme.chars().count();
    }
    out[len] = true;
    out
}

fn is_paragraph_break(rope: &Rope, p: usize, start: usize) -> bool {
    p >= start + 2 && rope.char(p - 1) == '\n' && rope.char(p - 2) == '\n'
}

fn is_sentence_end(rope: &Rope, p: usize, start: usize) -> bool {
    p >= start + 2
        && rope.char(p - 1).is_whitespace()
        && SENTENCE_TERMINATORS.contains(&rope.char(p - 2))
}
