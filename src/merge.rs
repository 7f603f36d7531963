//! Chunk-local to global offset translation and cross-chunk merging.

use std::collections::HashMap;

use ropey::Rope;
use tracing::warn;

use crate::annotation::Annotation;
use crate::chunker::Chunk;
use crate::error::MergeInconsistency;

/// Result of merging every chunk's findings for one text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Merged {
    /// Sorted by `start`, then `end`, then `source_chunk_index`.
    pub annotations: Vec<Annotation>,
    pub duplicates_collapsed: usize,
    pub inconsistencies: Vec<MergeInconsistency>,
}

/// Translates each annotation's offsets into the original text's coordinates.
pub fn remap(annotations: Vec<Annotation>, chunk: &Chunk) -> Vec<Annotation> {
    annotations
        .into_iter()
        .map(|a| a.remapped(chunk.start_offset))
        .collect()
}

/// Remaps each chunk's list, checks the span-match invariant against the
/// original text, and merges the survivors.
///
/// `per_chunk[i]` holds chunk-local annotations produced from `chunks[i]`.
pub fn remap_and_merge(
    original: &str,
    chunks: &[Chunk],
    per_chunk: Vec<Vec<Annotation>>,
) -> Merged {
    let rope = Rope::from_str(original);
    let mut inconsistencies = Vec::new();
    let mut global = Vec::new();

    for (chunk, annotations) in chunks.iter().zip(per_chunk) {
        for annotation in remap(annotations, chunk) {
            if span_holds(&rope, &annotation) {
                global.push(annotation);
            } else {
                warn!(
                    chunk = annotation.source_chunk_index,
                    start = annotation.start,
                    end = annotation.end,
                    "remapped span no longer matches source text"
                );
                inconsistencies.push(MergeInconsistency {
                    chunk_index: annotation.source_chunk_index,
                    start: annotation.start,
                    end: annotation.end,
                    text: annotation.text,
                });
            }
        }
    }

    let (annotations, duplicates_collapsed) = merge(global);
    Merged {
        annotations,
        duplicates_collapsed,
        inconsistencies,
    }
}

/// Collapses exact `(start, end, category, subtype)` duplicates and sorts.
///
/// Of two duplicates the higher confidence survives; on equal confidence the
/// one from the lower chunk index does. Returns the merged list and how many
/// entries were collapsed. Deterministic for a given input order.
pub fn merge(annotations: Vec<Annotation>) -> (Vec<Annotation>, usize) {
    let total = annotations.len();
    let mut kept: Vec<Annotation> = Vec::with_capacity(total);
    let mut slot_of: HashMap<(usize, usize, String, String), usize> = HashMap::new();

    for annotation in annotations {
        let key = annotation.key().to_owned_tuple();
        match slot_of.get(&key) {
            Some(&slot) => {
                if outranks(&annotation, &kept[slot]) {
                    kept[slot] = annotation;
                }
            }
            None => {
                slot_of.insert(key, kept.len());
                kept.push(annotation);
            }
        }
    }

    let collapsed = total - kept.len();
    // stable: equal keys keep first-seen order
    kept.sort_by_key(|a| (a.start, a.end, a.source_chunk_index));
    (kept, collapsed)
}

fn outranks(candidate: &Annotation, incumbent: &Annotation) -> bool {
    candidate.confidence > incumbent.confidence
        || (candidate.confidence == incumbent.confidence
            && candidate.source_chunk_index < incumbent.source_chunk_index)
}

fn span_holds(rope: &Rope, annotation: &Annotation) -> bool {
    annotation.start < annotation.end
        && rope
            .get_slice(annotation.start..annotation.end)
            .is_some_and(|slice| slice == annotation.text.as_str())
}
