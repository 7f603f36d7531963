//! The atomic annotation record.

use serde::{Deserialize, Serialize};

/// Applied when the model omits a confidence score.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// A classified span of source text.
///
/// `start`/`end` are half-open offsets counted in Unicode scalar values (chars).
/// Out of the parser they are local to the originating chunk; after remapping
/// they index the original, unchunked text and `text` equals that slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub text: String,
    pub category: String,
    pub subtype: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
    pub source_chunk_index: usize,
}

impl Annotation {
    pub fn len_chars(&self) -> usize {
        self.end - self.start
    }

    /// Identity used for deduplication and cross-format agreement.
    pub fn key(&self) -> SpanKey<'_> {
        SpanKey {
            start: self.start,
            end: self.end,
            category: &self.category,
            subtype: &self.subtype,
        }
    }

    /// Shifts chunk-local offsets by the chunk's start offset.
    /// An offset of zero leaves the annotation untouched.
    pub fn remapped(mut self, start_offset: usize) -> Self {
        self.start += start_offset;
        self.end += start_offset;
        self
    }

    /// True when `self.start..self.end` strictly contains `other`'s span.
    pub fn strictly_contains(&self, other: &Annotation) -> bool {
        self.start <= other.start
            && other.end <= self.end
            && (self.start, self.end) != (other.start, other.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanKey<'a> {
    pub start: usize,
    pub end: usize,
    pub category: &'a str,
    pub subtype: &'a str,
}

impl SpanKey<'_> {
    pub fn to_owned_tuple(&self) -> (usize, usize, String, String) {
        (
            self.start,
            self.end,
            self.category.to_string(),
            self.subtype.to_string(),
        )
    }
}
