//! Aggregate statistics derived from a merged run.
//!
//! Everything here is recomputed from the merged annotations and the
//! per-chunk reports; no counters are carried over from earlier stages.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::merge::Merged;
use crate::result::ChunkReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// At least one annotation, every chunk answered.
    Annotated,
    /// Every chunk answered, none produced a usable annotation.
    NoAnnotations,
    /// Some chunks failed; the others' annotations are present.
    Partial,
    /// Nothing could be processed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub index: usize,
    pub start_offset: usize,
    pub length: usize,
    /// Merged annotations attributed to this chunk (overlap counted once).
    pub annotations: usize,
    pub warnings: usize,
    pub corrected: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub status: RunStatus,
    /// Set for `partial` and `failed` runs; `None` means nothing went wrong.
    pub error: Option<String>,
    pub total_annotations: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_subtype: BTreeMap<String, BTreeMap<String, usize>>,
    pub average_confidence: Option<f64>,
    pub parse_warnings: usize,
    pub service_failures: usize,
    pub failed_chunks: Vec<usize>,
    pub corrected_spans: usize,
    pub duplicates_collapsed: usize,
    pub merge_inconsistencies: usize,
    /// Seconds.
    pub processing_time: f64,
    pub chunk_count: usize,
    pub per_chunk: Vec<ChunkStats>,
}

impl Statistics {
    /// Statistics for a text that never reached chunk dispatch.
    pub fn failed(reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(reason.into()),
            total_annotations: 0,
            by_category: BTreeMap::new(),
            by_subtype: BTreeMap::new(),
            average_confidence: None,
            parse_warnings: 0,
            service_failures: 0,
            failed_chunks: Vec::new(),
            corrected_spans: 0,
            duplicates_collapsed: 0,
            merge_inconsistencies: 0,
            processing_time: elapsed.as_secs_f64(),
            chunk_count: 0,
            per_chunk: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, RunStatus::Failed | RunStatus::Partial)
    }
}

pub fn aggregate(merged: &Merged, chunks: &[ChunkReport], elapsed: Duration) -> Statistics {
    let annotations = &merged.annotations;

    let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_subtype: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    let mut per_chunk_hits: BTreeMap<usize, usize> = BTreeMap::new();
    for a in annotations {
        *by_category.entry(a.category.clone()).or_default() += 1;
        *by_subtype
            .entry(a.category.clone())
            .or_default()
            .entry(a.subtype.clone())
            .or_default() += 1;
        *per_chunk_hits.entry(a.source_chunk_index).or_default() += 1;
    }

    let average_confidence = (!annotations.is_empty())
        .then(|| annotations.iter().map(|a| a.confidence).sum::<f64>() / annotations.len() as f64);

    let failed_chunks: Vec<usize> = chunks
        .iter()
        .filter(|c| c.failure.is_some())
        .map(|c| c.index)
        .collect();

    let per_chunk: Vec<ChunkStats> = chunks
        .iter()
        .map(|c| ChunkStats {
            index: c.index,
            start_offset: c.start_offset,
            length: c.length,
            annotations: per_chunk_hits.get(&c.index).copied().unwrap_or(0),
            warnings: c.warnings.len(),
            corrected: c.corrected,
            error: c.failure.as_ref().map(|f| f.to_string()),
        })
        .collect();

    let (status, error) = if !chunks.is_empty() && failed_chunks.len() == chunks.len() {
        (
            RunStatus::Failed,
            Some(format!("all {} chunks failed", chunks.len())),
        )
    } else if let Some(first) = chunks.iter().find_map(|c| c.failure.as_ref()) {
        (
            RunStatus::Partial,
            Some(format!(
                "{} of {} chunks failed; first error: {first}",
                failed_chunks.len(),
                chunks.len()
            )),
        )
    } else if annotations.is_empty() {
        (RunStatus::NoAnnotations, None)
    } else {
        (RunStatus::Annotated, None)
    };

    Statistics {
        status,
        error,
        total_annotations: annotations.len(),
        by_category,
        by_subtype,
        average_confidence,
        parse_warnings: chunks.iter().map(|c| c.warnings.len()).sum(),
        service_failures: failed_chunks.len(),
        failed_chunks,
        corrected_spans: chunks.iter().map(|c| c.corrected).sum(),
        duplicates_collapsed: merged.duplicates_collapsed,
        merge_inconsistencies: merged.inconsistencies.len(),
        processing_time: elapsed.as_secs_f64(),
        chunk_count: chunks.len(),
        per_chunk,
    }
}
