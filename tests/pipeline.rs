use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use glossator::output::{to_inline_markup, to_record, to_rows, write_outputs};
use glossator::{
    AnnotateError, AnnotationClient, Annotator, AnnotatorConfig, RetryPolicy, RunStatus,
    ServiceError, ServiceErrorKind, Taxonomy, ValidationError,
};

/// Answers from a fixed function of the chunk text and counts calls.
struct Mock {
    reply: fn(&str) -> Result<Value, ServiceError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl Mock {
    fn new(reply: fn(&str) -> Result<Value, ServiceError>) -> Self {
        Self {
            reply,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl AnnotationClient for Mock {
    fn source(&self) -> &str {
        "mock"
    }

    async fn submit(&self, chunk_text: &str, _: &Taxonomy) -> Result<Value, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.reply)(chunk_text)
    }
}

fn config() -> AnnotatorConfig {
    AnnotatorConfig {
        max_chunk_size: 1000,
        inter_request_delay_ms: 0,
        boundary_lookback: Some(20),
        retry: RetryPolicy::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        ..AnnotatorConfig::default()
    }
}

fn dios(_: &str) -> Result<Value, ServiceError> {
    Ok(json!([
        {"text": "Dios", "type": "Lexis", "subtype": "authority", "start": 0, "end": 4}
    ]))
}

/// Two chunks at max size 20: "Dios es bueno.\n\n" and "Amen dixo el rey."
const TWO_PARAGRAPHS: &str = "Dios es bueno.\n\nAmen dixo el rey.";

#[tokio::test]
async fn single_chunk_end_to_end() {
    let annotator = Annotator::new(Arc::new(Mock::new(dios)), config());
    let result = annotator.annotate("Dios es bueno. Amen.").await.unwrap();

    assert_eq!(result.total_annotations(), 1);
    let a = &result.annotations()[0];
    assert_eq!((a.start, a.end), (0, 4));
    assert_eq!(a.confidence, 0.5);
    assert_eq!(result.statistics().status, RunStatus::Annotated);
    assert_eq!(result.source(), "mock");

    let rows = to_rows(&result);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].annotation_text, "Dios");
}

#[tokio::test]
async fn chunk_offsets_are_remapped_to_the_original() {
    fn per_chunk(text: &str) -> Result<Value, ServiceError> {
        if text.starts_with("Amen") {
            Ok(json!({"annotations": [
                {"text": "rey", "type": "Lexis", "subtype": "authority", "start": 13, "end": 16, "confidence": 0.9}
            ]}))
        } else {
            dios(text)
        }
    }
    let annotator = Annotator::new(Arc::new(Mock::new(per_chunk)), config());
    let result = annotator
        .annotate_with_chunk_size(TWO_PARAGRAPHS, 20)
        .await
        .unwrap();

    assert_eq!(result.chunk_count(), 2);
    let spans: Vec<_> = result
        .annotations()
        .iter()
        .map(|a| (a.start, a.end, a.source_chunk_index))
        .collect();
    assert_eq!(spans, vec![(0, 4, 0), (29, 32, 1)]);
    let chars: Vec<char> = TWO_PARAGRAPHS.chars().collect();
    let rey: String = chars[29..32].iter().collect();
    assert_eq!(rey, "rey");
}

#[tokio::test]
async fn failed_chunk_does_not_sink_the_others() {
    fn flaky(text: &str) -> Result<Value, ServiceError> {
        if text.contains("rey") {
            Err(ServiceError::transient("connection reset"))
        } else {
            dios(text)
        }
    }
    let mock = Arc::new(Mock::new(flaky));
    let annotator = Annotator::new(mock.clone(), config());
    let result = annotator
        .annotate_with_chunk_size(TWO_PARAGRAPHS, 20)
        .await
        .unwrap();

    assert_eq!(result.total_annotations(), 1);
    let stats = result.statistics();
    assert_eq!(stats.status, RunStatus::Partial);
    assert_eq!(stats.failed_chunks, vec![1]);
    assert_eq!(stats.service_failures, 1);
    assert!(stats.error.as_deref().unwrap().contains("connection reset"));
    let failure = result.chunk_reports()[1].failure.as_ref().unwrap();
    assert_eq!(failure.kind, ServiceErrorKind::Transient);
    // one call for the good chunk, three attempts for the bad one
    assert_eq!(mock.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn every_chunk_failing_is_an_error() {
    let annotator = Annotator::new(
        Arc::new(Mock::new(|_| Err(ServiceError::fatal("invalid api key")))),
        config(),
    );
    match annotator.annotate_with_chunk_size(TWO_PARAGRAPHS, 20).await {
        Err(AnnotateError::AllChunksFailed {
            chunks,
            last,
            reports,
        }) => {
            assert_eq!(chunks, 2);
            assert_eq!(last.kind, ServiceErrorKind::Fatal);
            assert_eq!(reports.len(), 2);
            assert!(reports.iter().all(|r| r.failure.is_some()));
        }
        other => panic!("expected AllChunksFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_text_in_a_batch_keeps_its_chunk_reports() {
    let annotator = Annotator::new(
        Arc::new(Mock::new(|_| Err(ServiceError::fatal("invalid api key")))),
        config(),
    );
    let results = annotator.annotate_many(&[TWO_PARAGRAPHS], 20).await;
    assert_eq!(results.len(), 1);

    let result = &results[0];
    assert_eq!(result.chunk_count(), 2);
    assert_eq!(result.chunk_reports().len(), 2);
    let stats = result.statistics();
    assert_eq!(stats.status, RunStatus::Failed);
    assert_eq!(stats.failed_chunks, vec![0, 1]);
    assert_eq!(stats.service_failures, 2);
    assert_eq!(stats.per_chunk.len(), 2);
    assert!(stats.per_chunk[0]
        .error
        .as_deref()
        .unwrap()
        .contains("invalid api key"));
    assert_eq!(result.total_annotations(), 0);
}

#[tokio::test]
async fn validation_boundaries() {
    let mock = Arc::new(Mock::new(dios));
    let annotator = Annotator::new(mock.clone(), config());
    assert!(annotator.validate(&"a".repeat(10)).is_ok());
    assert!(annotator.validate(&"a".repeat(100_000)).is_ok());
    assert_eq!(
        annotator.validate(&"a".repeat(9)),
        Err(ValidationError::TooShort { chars: 9, min: 10 })
    );
    assert_eq!(
        annotator.validate(&"a".repeat(100_001)),
        Err(ValidationError::TooLong {
            chars: 100_001,
            max: 100_000
        })
    );
    assert!(matches!(
        annotator.annotate_with_chunk_size("Dios es bueno. Amen.", 0).await,
        Err(AnnotateError::Validation(ValidationError::ZeroChunkSize))
    ));
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn model_noise_becomes_warnings() {
    fn noisy(_: &str) -> Result<Value, ServiceError> {
        Ok(json!([
            {"text": "Dios", "type": "Lexis", "subtype": "authority", "start": 0, "end": 4},
            {"text": "bueno", "type": "Heraldry", "subtype": "arms", "start": 8, "end": 13},
            {"text": "Amen", "type": "Notes", "subtype": "ambiguity", "confidence": 1.7},
            "not an object",
            {"text": "bueno", "type": "Lexis", "subtype": "religious"}
        ]))
    }
    let annotator = Annotator::new(Arc::new(Mock::new(noisy)), config());
    let result = annotator.annotate("Dios es bueno. Amen.").await.unwrap();

    let stats = result.statistics();
    assert_eq!(result.total_annotations(), 2);
    assert_eq!(stats.parse_warnings, 3);
    assert_eq!(stats.corrected_spans, 1);
    assert_eq!(stats.status, RunStatus::Annotated);
    let bueno = &result.annotations()[1];
    assert_eq!((bueno.start, bueno.end), (8, 13));
}

#[tokio::test]
async fn overlap_duplicates_are_collapsed() {
    fn everywhere(text: &str) -> Result<Value, ServiceError> {
        // report "bueno" wherever it appears in the chunk
        let chars: Vec<char> = text.chars().collect();
        let hits: Vec<Value> = (0..chars.len().saturating_sub(4))
            .filter(|&i| chars[i..i + 5].iter().collect::<String>() == "bueno")
            .map(|i| json!({"text": "bueno", "type": "Lexis", "subtype": "religious", "start": i, "end": i + 5}))
            .collect();
        Ok(Value::Array(hits))
    }
    let cfg = AnnotatorConfig {
        chunk_overlap: 8,
        ..config()
    };
    let annotator = Annotator::new(Arc::new(Mock::new(everywhere)), cfg);
    let result = annotator
        .annotate_with_chunk_size("Dios es bueno. Amen dixo el rey.", 16)
        .await
        .unwrap();

    assert!(result.chunk_count() >= 2);
    assert_eq!(result.total_annotations(), 1);
    assert_eq!(result.annotations()[0].start, 8);
    assert_eq!(
        result.statistics().duplicates_collapsed + 1,
        result
            .chunk_reports()
            .iter()
            .map(|c| c.accepted)
            .sum::<usize>()
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_dispatch_and_discards_results() {
    let mock = Arc::new(Mock::new(dios).slow(Duration::from_secs(1)));
    let cfg = AnnotatorConfig {
        max_concurrency: 1,
        ..config()
    };
    let annotator = Annotator::new(mock.clone(), cfg);

    let (outcome, ()) = tokio::join!(
        annotator.annotate_with_chunk_size(TWO_PARAGRAPHS, 20),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            annotator.cancel();
        }
    );

    assert!(matches!(outcome, Err(AnnotateError::Cancelled)));
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_keeps_order_and_length() {
    let annotator = Annotator::new(Arc::new(Mock::new(dios)), config());
    let texts = ["Dios es bueno. Amen.", "corto", "Dios salve al rey."];
    let mut seen = Vec::new();
    let results = annotator
        .annotate_many_with(&texts, 1000, |i, _| seen.push(i))
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(seen, vec![0, 1, 2]);
    for (text, result) in texts.iter().zip(&results) {
        assert_eq!(result.text(), *text);
    }
    assert_eq!(results[0].total_annotations(), 1);
    let failed = results[1].statistics();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("minimum is 10"));
    assert_eq!(results[2].statistics().status, RunStatus::Annotated);
}

#[tokio::test(start_paused = true)]
async fn batch_waits_between_texts() {
    let cfg = AnnotatorConfig {
        inter_request_delay_ms: 1000,
        ..config()
    };
    let annotator = Annotator::new(Arc::new(Mock::new(dios)), cfg);
    let started = tokio::time::Instant::now();
    let results = annotator
        .annotate_many(&["Dios es bueno. Amen.", "Dios salve al rey."], 1000)
        .await;
    assert_eq!(results.len(), 2);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn output_formats_agree() {
    fn several(_: &str) -> Result<Value, ServiceError> {
        Ok(json!([
            {"text": "Dios es bueno", "type": "Rhetoric", "subtype": "formula", "start": 0, "end": 13},
            {"text": "Dios", "type": "Lexis", "subtype": "authority", "start": 0, "end": 4, "confidence": 0.8},
            {"text": "Amen", "type": "Lexis", "subtype": "religious", "start": 15, "end": 19}
        ]))
    }
    let annotator = Annotator::new(Arc::new(Mock::new(several)), config());
    let result = annotator.annotate("Dios es bueno. Amen.").await.unwrap();

    let markup = to_inline_markup(&result);
    let rows = to_rows(&result);
    let record = to_record(&result);
    assert_eq!(result.total_annotations(), 3);
    assert_eq!(markup.matches("<annotation ").count(), 3);
    assert_eq!(rows.len(), 3);
    assert_eq!(record.annotations.len(), 3);
    assert_eq!(record.metadata.total_annotations, 3);
    assert_eq!(result.statistics().total_annotations, 3);
    for (row, entry) in rows.iter().zip(&record.annotations) {
        assert_eq!(row.start_position, entry.start);
        assert_eq!(row.end_position, entry.end);
        assert_eq!(row.annotation_type, entry.annotation_type);
    }
}

#[tokio::test]
async fn writes_every_output_file() {
    let annotator = Annotator::new(Arc::new(Mock::new(dios)), config());
    let result = annotator.annotate("Dios es bueno. Amen.").await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let paths = write_outputs(&result, dir.path().join("nested"), "cronica").unwrap();
    for path in [
        &paths.markup,
        &paths.parquet,
        &paths.rows,
        &paths.record,
        &paths.statistics,
    ] {
        assert!(path.exists(), "{} missing", path.display());
    }
    assert!(std::fs::metadata(&paths.parquet).unwrap().len() > 0);

    let xml = std::fs::read_to_string(&paths.markup).unwrap();
    assert!(xml.contains(">Dios</annotation> es bueno. Amen."));
    let record: Value = serde_json::from_str(&std::fs::read_to_string(&paths.record).unwrap()).unwrap();
    assert_eq!(record["annotations"][0]["text"], "Dios");
    let stats: Value =
        serde_json::from_str(&std::fs::read_to_string(&paths.statistics).unwrap()).unwrap();
    assert_eq!(stats["status"], "annotated");
    assert_eq!(stats["by_category"]["Lexis"], 1);
}
