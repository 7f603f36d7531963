//! Error and warning types shared across the annotation pipeline.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::result::ChunkReport;

/// Input text rejected before any chunking happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("input text is empty")]
    Empty,
    #[error("input text has {chars} characters, minimum is {min}")]
    TooShort { chars: usize, min: usize },
    #[error("input text has {chars} characters, maximum is {max}")]
    TooLong { chars: usize, max: usize },
    #[error("max_chunk_size must be greater than zero")]
    ZeroChunkSize,
}

/// Classification of a failed call to the annotation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    /// 429 or an equivalent quota-per-window signal. Retryable.
    RateLimited,
    /// Network failure, timeout, or 5xx. Retryable.
    Transient,
    /// The service answered but the body could not be decoded. Not retried;
    /// the body (if any) is handed to the response parser.
    InvalidResponse,
    /// Authentication, exhausted quota, or a request the service will never accept.
    Fatal,
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceErrorKind::RateLimited => "rate limited",
            ServiceErrorKind::Transient => "transient",
            ServiceErrorKind::InvalidResponse => "invalid response",
            ServiceErrorKind::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} service error: {message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
    /// Server-provided hint for how long to wait before the next attempt.
    pub retry_after: Option<Duration>,
    /// Raw body for `InvalidResponse`, so the parser can try to salvage it.
    pub body: Option<String>,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            body: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ServiceErrorKind::RateLimited, message)
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Fatal, message)
    }

    pub fn invalid_response(message: impl Into<String>, body: Option<String>) -> Self {
        Self {
            body,
            ..Self::new(ServiceErrorKind::InvalidResponse, message)
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::RateLimited | ServiceErrorKind::Transient
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseWarningKind {
    UnparseablePayload,
    MalformedEntry,
    UnknownCategory,
    UnknownSubtype,
    InvalidConfidence,
    SpanNotFound,
}

/// Non-fatal problem found while turning a model response into annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub chunk_index: usize,
    /// Position of the offending entry in the model's list, when there is one.
    pub entry_index: Option<usize>,
    pub kind: ParseWarningKind,
    pub detail: String,
}

impl ParseWarning {
    pub(crate) fn new(
        chunk_index: usize,
        entry_index: Option<usize>,
        kind: ParseWarningKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            chunk_index,
            entry_index,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entry_index {
            Some(entry) => write!(
                f,
                "chunk {} entry {}: {:?}: {}",
                self.chunk_index, entry, self.kind, self.detail
            ),
            None => write!(f, "chunk {}: {:?}: {}", self.chunk_index, self.kind, self.detail),
        }
    }
}

/// An annotation whose global span no longer matches the original text.
/// Dropped and counted, never propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeInconsistency {
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Failure of a whole-text `annotate` call.
#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// `reports` keeps every chunk's failure for auditing.
    #[error("all {chunks} chunks failed; last error: {last}")]
    AllChunksFailed {
        chunks: usize,
        last: ServiceError,
        reports: Vec<ChunkReport>,
    },
    #[error("annotation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("parquet encoding failed: {0}")]
    Parquet(#[from] arrow2::error::Error),
    #[error("invalid output base name `{0}`")]
    InvalidBaseName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limited_and_transient_are_retryable() {
        assert!(ServiceError::rate_limited("slow down", None).is_retryable());
        assert!(ServiceError::transient("reset").is_retryable());
        assert!(!ServiceError::fatal("bad key").is_retryable());
        assert!(!ServiceError::invalid_response("garbled", None).is_retryable());
    }

    #[test]
    fn warning_display_names_entry() {
        let w = ParseWarning::new(2, Some(5), ParseWarningKind::UnknownSubtype, "Lexis/foo");
        assert_eq!(w.to_string(), "chunk 2 entry 5: UnknownSubtype: Lexis/foo");
    }
}
