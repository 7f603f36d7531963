//! Flat, one-row-per-annotation table and its Parquet encoding.

use std::fs::File;
use std::path::Path;

use arrow2::array::{Array, Float64Array, UInt64Array, Utf8Array};
use arrow2::chunk::Chunk;
use arrow2::datatypes::{DataType, Field, Schema};
use arrow2::io::parquet::write as pq;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::OutputError;
use crate::result::AnnotationResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub chunk_index: usize,
    pub annotation_text: String,
    pub start_position: usize,
    pub end_position: usize,
    #[serde(rename = "type")]
    pub annotation_type: String,
    pub subtype: String,
    /// Chars.
    pub text_length: usize,
    /// Chars of the source chunk.
    pub chunk_length: usize,
    /// Seconds for the whole run.
    pub processing_time: f64,
    pub confidence: f64,
    pub source: String,
}

pub fn to_rows(result: &AnnotationResult) -> Vec<TableRow> {
    result
        .annotations()
        .iter()
        .map(|a| TableRow {
            chunk_index: a.source_chunk_index,
            annotation_text: a.text.clone(),
            start_position: a.start,
            end_position: a.end,
            annotation_type: a.category.clone(),
            subtype: a.subtype.clone(),
            text_length: a.len_chars(),
            chunk_length: result.chunk_length(a.source_chunk_index),
            processing_time: result.processing_time(),
            confidence: a.confidence,
            source: result.source().to_string(),
        })
        .collect()
}

pub fn write_parquet<P: AsRef<Path>>(rows: &[TableRow], path: P) -> Result<(), OutputError> {
    let path = path.as_ref();
    info!(rows = rows.len(), path = %path.display(), "writing parquet table");

    let u64_column = |f: fn(&TableRow) -> usize| -> Box<dyn Array> {
        Box::new(UInt64Array::from_vec(
            rows.iter().map(|r| f(r) as u64).collect(),
        ))
    };
    let utf8_column = |f: fn(&TableRow) -> &str| -> Box<dyn Array> {
        Box::new(Utf8Array::<i32>::from_slice(
            rows.iter().map(f).collect::<Vec<_>>(),
        ))
    };
    let f64_column = |f: fn(&TableRow) -> f64| -> Box<dyn Array> {
        Box::new(Float64Array::from_vec(rows.iter().map(f).collect()))
    };

    let schema = Schema::from(vec![
        Field::new("chunk_index", DataType::UInt64, false),
        Field::new("annotation_text", DataType::Utf8, false),
        Field::new("start_position", DataType::UInt64, false),
        Field::new("end_position", DataType::UInt64, false),
        Field::new("type", DataType::Utf8, false),
        Field::new("subtype", DataType::Utf8, false),
        Field::new("text_length", DataType::UInt64, false),
        Field::new("chunk_length", DataType::UInt64, false),
        Field::new("processing_time", DataType::Float64, false),
        Field::new("confidence", DataType::Float64, false),
        Field::new("source", DataType::Utf8, false),
    ]);

    let columns: Vec<Box<dyn Array>> = vec![
        u64_column(|r| r.chunk_index),
        utf8_column(|r| r.annotation_text.as_str()),
        u64_column(|r| r.start_position),
        u64_column(|r| r.end_position),
        utf8_column(|r| r.annotation_type.as_str()),
        utf8_column(|r| r.subtype.as_str()),
        u64_column(|r| r.text_length),
        u64_column(|r| r.chunk_length),
        f64_column(|r| r.processing_time),
        f64_column(|r| r.confidence),
        utf8_column(|r| r.source.as_str()),
    ];
    let chunk = Chunk::try_new(columns)?;

    let (options, encodings) = encoding_plan(&schema);
    let row_groups =
        pq::RowGroupIterator::try_new(std::iter::once(Ok(chunk)), &schema, options, encodings)?;

    let mut file = File::create(path).map_err(|source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = pq::FileWriter::try_new(&mut file, schema, options)?;
    for group in row_groups {
        writer.write(group?)?;
    }
    writer.end(None)?;
    Ok(())
}

/// Zstd with page statistics; every column is a flat primitive, so each gets
/// a single plain encoding.
fn encoding_plan(schema: &Schema) -> (pq::WriteOptions, Vec<Vec<pq::Encoding>>) {
    let options = pq::WriteOptions {
        write_statistics: true,
        compression: pq::CompressionOptions::Zstd(None),
        version: pq::Version::V2,
        data_pagesize_limit: None,
    };
    let encodings = vec![vec![pq::Encoding::Plain]; schema.fields.len()];
    (options, encodings)
}
