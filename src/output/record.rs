//! Nested, training-ready record of a run.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::result::AnnotationResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub metadata: RecordMetadata,
    pub annotations: Vec<RecordEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub document_id: Uuid,
    pub source: String,
    pub total_annotations: usize,
    pub processing_time: f64,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub text: String,
    #[serde(rename = "type")]
    pub annotation_type: String,
    pub subtype: String,
    pub start: usize,
    pub end: usize,
    pub chunk_index: usize,
}

pub fn to_record(result: &AnnotationResult) -> StructuredRecord {
    StructuredRecord {
        metadata: RecordMetadata {
            document_id: result.document_id(),
            source: result.source().to_string(),
            total_annotations: result.total_annotations(),
            processing_time: result.processing_time(),
            chunk_count: result.chunk_count(),
        },
        annotations: result
            .annotations()
            .iter()
            .map(|a| RecordEntry {
                text: a.text.clone(),
                annotation_type: a.category.clone(),
                subtype: a.subtype.clone(),
                start: a.start,
                end: a.end,
                chunk_index: a.source_chunk_index,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests_support::result_with;

    #[test]
    fn metadata_and_flat_entries() {
        let result = result_with("Dios es bueno. Amen.", &[(0, 4, "Lexis", "authority")]);
        let value = serde_json::to_value(to_record(&result)).unwrap();
        assert_eq!(value["metadata"]["total_annotations"], 1);
        assert_eq!(value["metadata"]["chunk_count"], 1);
        assert_eq!(value["metadata"]["processing_time"], 0.25);
        assert_eq!(
            value["annotations"][0],
            serde_json::json!({
                "text": "Dios",
                "type": "Lexis",
                "subtype": "authority",
                "start": 0,
                "end": 4,
                "chunk_index": 0
            })
        );
    }
}
