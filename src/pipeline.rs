//! The public entry point: validate, chunk, dispatch, parse, merge, report.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::annotation::Annotation;
use crate::chunker::{Chunk, Chunker};
use crate::client::{request_annotations, AnnotationClient, ServiceLimiter};
use crate::config::AnnotatorConfig;
use crate::error::{
    AnnotateError, OutputError, ParseWarning, ParseWarningKind, ServiceError, ServiceErrorKind,
    ValidationError,
};
use crate::merge::{self, Merged};
use crate::output::{self, OutputPaths};
use crate::parser::{self, Parsed};
use crate::result::{AnnotationResult, ChunkFailure, ChunkReport};
use crate::taxonomy::Taxonomy;

/// Annotates texts against one service and one taxonomy.
///
/// The taxonomy and config are fixed for the annotator's lifetime. Once
/// [`cancel`](Annotator::cancel) is called the annotator stays cancelled.
pub struct Annotator {
    client: Arc<dyn AnnotationClient>,
    taxonomy: Arc<Taxonomy>,
    config: AnnotatorConfig,
    limiter: ServiceLimiter,
    stop_requested: Arc<AtomicBool>,
}

struct ChunkOutcome {
    report: ChunkReport,
    annotations: Vec<Annotation>,
    error: Option<ServiceError>,
}

impl Annotator {
    pub fn new(client: Arc<dyn AnnotationClient>, config: AnnotatorConfig) -> Self {
        let limiter = ServiceLimiter::new(config.max_concurrency);
        Self {
            client,
            taxonomy: Arc::new(Taxonomy::medieval()),
            config,
            limiter,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_taxonomy(mut self, taxonomy: Taxonomy) -> Self {
        self.taxonomy = Arc::new(taxonomy);
        self
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn config(&self) -> &AnnotatorConfig {
        &self.config
    }

    pub fn source(&self) -> &str {
        self.client.source()
    }

    /// Length checks run before any chunking or service call.
    pub fn validate(&self, text: &str) -> Result<(), ValidationError> {
        self.config.text_bounds().check(text).map(|_| ())
    }

    /// Stops dispatching new chunks. Calls already in flight run to
    /// completion and their results are discarded.
    pub fn cancel(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("🛑 cancellation requested");
        }
        self.limiter.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn chunker(&self, max_chunk_size: usize) -> Chunker {
        let mut chunker = Chunker::new(max_chunk_size)
            .with_overlap(self.config.chunk_overlap)
            .with_bounds(self.config.text_bounds());
        if let Some(lookback) = self.config.boundary_lookback {
            chunker = chunker.with_lookback(lookback);
        }
        chunker
    }

    /// Annotates with the configured chunk size.
    pub async fn annotate(&self, text: &str) -> Result<AnnotationResult, AnnotateError> {
        self.annotate_with_chunk_size(text, self.config.max_chunk_size)
            .await
    }

    /// Chunk failures are recorded in the result. The call only fails when
    /// the text is invalid, every chunk failed, or the run was cancelled.
    #[tracing::instrument(
        skip_all,
        fields(chars = text.chars().count(), max_chunk_size = max_chunk_size)
    )]
    pub async fn annotate_with_chunk_size(
        &self,
        text: &str,
        max_chunk_size: usize,
    ) -> Result<AnnotationResult, AnnotateError> {
        let started = Instant::now();
        if self.is_cancelled() {
            return Err(AnnotateError::Cancelled);
        }
        let chunks = self.chunker(max_chunk_size).chunk(text)?;
        info!(chunks = chunks.len(), "📄 annotating text");

        let outcomes = join_all(chunks.iter().map(|chunk| self.process_chunk(chunk))).await;

        if self.is_cancelled() {
            warn!("run cancelled, discarding {} chunk results", outcomes.len());
            return Err(AnnotateError::Cancelled);
        }

        let mut reports = Vec::with_capacity(outcomes.len());
        let mut per_chunk = Vec::with_capacity(outcomes.len());
        let mut last_error = None;
        for outcome in outcomes {
            if outcome.error.is_some() {
                last_error = outcome.error;
            }
            reports.push(outcome.report);
            per_chunk.push(outcome.annotations);
        }

        if let Some(last) = last_error {
            if reports.iter().all(|r| r.failure.is_some()) {
                warn!(chunks = reports.len(), "every chunk failed");
                return Err(AnnotateError::AllChunksFailed {
                    chunks: reports.len(),
                    last,
                    reports,
                });
            }
        }

        let merged = merge::remap_and_merge(text, &chunks, per_chunk);
        let result = AnnotationResult::new(
            text.to_string(),
            self.client.source().to_string(),
            merged,
            reports,
            started.elapsed(),
        );
        let stats = result.statistics();
        info!(
            annotations = stats.total_annotations,
            warnings = stats.parse_warnings,
            failed_chunks = stats.failed_chunks.len(),
            secs = stats.processing_time,
            "✅ annotation finished"
        );
        Ok(result)
    }

    #[tracing::instrument(skip_all, fields(chunk = chunk.index, start = chunk.start_offset))]
    async fn process_chunk(&self, chunk: &Chunk) -> ChunkOutcome {
        let started = Instant::now();
        let response = request_annotations(
            self.client.as_ref(),
            &chunk.text,
            &self.taxonomy,
            &self.config.retry,
            &self.limiter,
        )
        .await;

        let (parsed, error) = match response {
            Ok(raw) => (parser::parse(&raw, chunk, &self.taxonomy), None),
            Err(err) if err.kind == ServiceErrorKind::InvalidResponse => {
                let parsed = match err.body.as_deref() {
                    Some(body) => parser::parse_text(body, chunk, &self.taxonomy),
                    None => Parsed {
                        warnings: vec![ParseWarning::new(
                            chunk.index,
                            None,
                            ParseWarningKind::UnparseablePayload,
                            err.message.clone(),
                        )],
                        ..Parsed::default()
                    },
                };
                (parsed, None)
            }
            Err(err) => (Parsed::default(), Some(err)),
        };

        debug!(
            accepted = parsed.annotations.len(),
            warnings = parsed.warnings.len(),
            failed = error.is_some(),
            "chunk processed"
        );

        ChunkOutcome {
            report: ChunkReport {
                index: chunk.index,
                start_offset: chunk.start_offset,
                length: chunk.len_chars(),
                overlap: chunk.overlap,
                accepted: parsed.annotations.len(),
                warnings: parsed.warnings,
                corrected: parsed.corrected,
                failure: error.as_ref().map(ChunkFailure::from),
                elapsed: started.elapsed(),
            },
            annotations: parsed.annotations,
            error,
        }
    }

    /// Annotates each text in turn, pausing between texts. Always returns one
    /// result per input, in input order; a text that could not be annotated
    /// yields a failed result, with its chunk reports when chunks were sent.
    pub async fn annotate_many<S: AsRef<str>>(
        &self,
        texts: &[S],
        max_chunk_size: usize,
    ) -> Vec<AnnotationResult> {
        self.annotate_many_with(texts, max_chunk_size, |_, _| {})
            .await
    }

    /// Like [`annotate_many`](Self::annotate_many), calling `on_result` as
    /// each text completes.
    pub async fn annotate_many_with<S, F>(
        &self,
        texts: &[S],
        max_chunk_size: usize,
        mut on_result: F,
    ) -> Vec<AnnotationResult>
    where
        S: AsRef<str>,
        F: FnMut(usize, &AnnotationResult),
    {
        let mut results = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let text = text.as_ref();
            if i > 0 && !self.is_cancelled() {
                tokio::time::sleep(self.config.inter_request_delay()).await;
            }

            let started = Instant::now();
            let result = match self.annotate_with_chunk_size(text, max_chunk_size).await {
                Ok(result) => result,
                Err(AnnotateError::AllChunksFailed { last, reports, .. }) => {
                    warn!(text = i, "annotation failed, last error: {last}");
                    AnnotationResult::new(
                        text.to_string(),
                        self.client.source().to_string(),
                        Merged::default(),
                        reports,
                        started.elapsed(),
                    )
                }
                Err(err) => {
                    warn!(text = i, "annotation failed: {err}");
                    AnnotationResult::failed(
                        text.to_string(),
                        self.client.source().to_string(),
                        err.to_string(),
                        started.elapsed(),
                    )
                }
            };
            on_result(i, &result);
            results.push(result);
        }
        results
    }

    /// Writes every output format for `result`; see [`output::write_outputs`].
    pub fn write_outputs(
        &self,
        result: &AnnotationResult,
        dir: impl AsRef<Path>,
        base: &str,
    ) -> Result<OutputPaths, OutputError> {
        output::write_outputs(result, dir, base)
    }
}
