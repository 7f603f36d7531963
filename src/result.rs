//! The terminal, read-only artifact of one `annotate` call.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::annotation::Annotation;
use crate::error::{ParseWarning, ServiceError, ServiceErrorKind};
use crate::merge::Merged;
use crate::stats::{self, Statistics};

/// A chunk's service failure, kept in its report instead of being raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl From<&ServiceError> for ChunkFailure {
    fn from(err: &ServiceError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What happened to one chunk, kept for auditability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub index: usize,
    pub start_offset: usize,
    /// Length in chars.
    pub length: usize,
    pub overlap: usize,
    /// Candidates that passed parsing, before remapping and merging.
    pub accepted: usize,
    pub warnings: Vec<ParseWarning>,
    pub corrected: usize,
    pub failure: Option<ChunkFailure>,
    #[serde(with = "seconds")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct AnnotationResult {
    document_id: Uuid,
    source: String,
    text: String,
    annotations: Vec<Annotation>,
    chunks: Vec<ChunkReport>,
    statistics: Statistics,
}

impl AnnotationResult {
    pub(crate) fn new(
        text: String,
        source: String,
        merged: Merged,
        chunks: Vec<ChunkReport>,
        elapsed: Duration,
    ) -> Self {
        let statistics = stats::aggregate(&merged, &chunks, elapsed);
        Self {
            document_id: Uuid::new_v4(),
            source,
            text,
            annotations: merged.annotations,
            chunks,
            statistics,
        }
    }

    /// A result for a text that could not be annotated at all.
    pub fn failed(text: String, source: String, reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            document_id: Uuid::new_v4(),
            source,
            text,
            annotations: Vec::new(),
            chunks: Vec::new(),
            statistics: Statistics::failed(reason, elapsed),
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Label of the annotation service that produced the findings.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The original, unchunked text all offsets refer to.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Merged annotations sorted by `start`, `end`, `source_chunk_index`.
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn chunk_reports(&self) -> &[ChunkReport] {
        &self.chunks
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn total_annotations(&self) -> usize {
        self.annotations.len()
    }

    /// Seconds.
    pub fn processing_time(&self) -> f64 {
        self.statistics.processing_time
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Length in chars of the chunk an annotation came from.
    pub fn chunk_length(&self, chunk_index: usize) -> usize {
        self.chunks
            .get(chunk_index)
            .map_or(0, |report| report.length)
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
