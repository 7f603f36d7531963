//! Glossator
//! ---------
//! Annotates medieval Spanish and Catalan prose with a fixed taxonomy of
//! literary, rhetorical and lexical features, using a language model as the
//! classifier.
//!
//! Pipeline:
//!   text -> validate -> chunk -> annotation service (retry, limit) -> parse
//!        -> remap offsets -> merge -> AnnotationResult -> XML / Parquet / JSON
//!
//! All offsets are char (Unicode scalar value) indices into the original
//! text, `start` inclusive and `end` exclusive.

pub mod annotation;
pub mod chunker;
pub mod client;
pub mod config;
pub mod error;
pub mod merge;
pub mod openai;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod result;
pub mod stats;
pub mod taxonomy;

pub use annotation::Annotation;
pub use chunker::{chunk, Chunk, Chunker, TextBounds};
pub use client::{request_annotations, AnnotationClient, RetryPolicy, ServiceLimiter};
pub use config::AnnotatorConfig;
pub use error::{
    AnnotateError, MergeInconsistency, OutputError, ParseWarning, ParseWarningKind, ServiceError,
    ServiceErrorKind, ValidationError,
};
pub use openai::OpenAiClient;
pub use pipeline::Annotator;
pub use result::{AnnotationResult, ChunkFailure, ChunkReport};
pub use stats::{RunStatus, Statistics};
pub use taxonomy::Taxonomy;
