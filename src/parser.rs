//! Turns heterogeneous model payloads into validated, chunk-local annotations.
//!
//! The parser never fails as a whole: anything it cannot use becomes a
//! [`ParseWarning`] and the remaining entries still go through.

use ropey::Rope;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::annotation::{Annotation, DEFAULT_CONFIDENCE};
use crate::chunker::Chunk;
use crate::error::{ParseWarning, ParseWarningKind};
use crate::taxonomy::Taxonomy;

const LIST_KEYS: &[&str] = &["annotations", "extractions", "items", "results"];
const MAX_UNWRAP_DEPTH: usize = 4;

/// One candidate as the model sent it. Unknown fields are ignored; wrong
/// types make the whole entry malformed rather than being coerced.
#[derive(Debug, Deserialize)]
struct RawAnnotation {
    text: Option<String>,
    #[serde(alias = "type")]
    category: Option<String>,
    subtype: Option<String>,
    start: Option<i64>,
    end: Option<i64>,
    confidence: Option<f64>,
}

/// Outcome of parsing one chunk's payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parsed {
    /// Offsets are local to the chunk.
    pub annotations: Vec<Annotation>,
    pub warnings: Vec<ParseWarning>,
    /// Entries whose offsets were recomputed by locating their text.
    pub corrected: usize,
}

pub fn parse(raw: &Value, chunk: &Chunk, taxonomy: &Taxonomy) -> Parsed {
    let mut parsed = Parsed::default();
    let entries = match locate_entries(raw, 0) {
        Ok(entries) => entries,
        Err(reason) => {
            warn!(chunk = chunk.index, "unusable model payload: {reason}");
            parsed.warnings.push(ParseWarning::new(
                chunk.index,
                None,
                ParseWarningKind::UnparseablePayload,
                reason,
            ));
            return parsed;
        }
    };

    let rope = Rope::from_str(&chunk.text);
    for (entry_index, entry) in entries.into_iter().enumerate() {
        match validate_entry(entry, entry_index, chunk, &rope, taxonomy) {
            Ok((annotation, corrected)) => {
                if corrected {
                    parsed.corrected += 1;
                }
                parsed.annotations.push(annotation);
            }
            Err(warning) => {
                debug!(chunk = chunk.index, %warning, "dropping candidate");
                parsed.warnings.push(warning);
            }
        }
    }
    parsed
}

/// Parses a textual response body, e.g. one salvaged from an invalid response.
pub fn parse_text(body: &str, chunk: &Chunk, taxonomy: &Taxonomy) -> Parsed {
    parse(&Value::String(body.to_string()), chunk, taxonomy)
}

fn locate_entries(value: &Value, depth: usize) -> Result<Vec<Value>, String> {
    if depth > MAX_UNWRAP_DEPTH {
        return Err("payload nested too deeply".to_string());
    }
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(text) => {
            let decoded = decode_json_text(text)
                .ok_or_else(|| format!("response text is not JSON: {}", preview(text)))?;
            locate_entries(&decoded, depth + 1)
        }
        Value::Object(map) => {
            for key in LIST_KEYS {
                if let Some(found) = map.get(*key) {
                    return locate_entries(found, depth + 1);
                }
            }
            if let Some(inner) = envelope_text(value) {
                return locate_entries(&Value::String(inner.to_string()), depth + 1);
            }
            if map.contains_key("text") && (map.contains_key("category") || map.contains_key("type")) {
                return Ok(vec![value.clone()]);
            }
            Err("object payload has no annotation list".to_string())
        }
        Value::Null => Ok(Vec::new()),
        other => Err(format!("unexpected payload type: {other}")),
    }
}

/// Text carried inside the common LLM response envelopes.
fn envelope_text(value: &Value) -> Option<&str> {
    // Responses API: output[].content[] with type output_text
    if let Some(outputs) = value.get("output").and_then(Value::as_array) {
        for item in outputs {
            let contents = item.get("content").and_then(Value::as_array);
            for content in contents.into_iter().flatten() {
                if content.get("type").and_then(Value::as_str) == Some("output_text") {
                    if let Some(text) = content.get("text").and_then(Value::as_str) {
                        return Some(text);
                    }
                }
            }
        }
    }
    if let Some(text) = value.get("output_text").and_then(Value::as_str) {
        return Some(text);
    }
    // Chat Completions: choices[0].message.content
    if let Some(text) = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return Some(text);
    }
    value.pointer("/content/0/text").and_then(Value::as_str)
}

/// Parses JSON out of model text, tolerating code fences and chatter around it.
fn decode_json_text(text: &str) -> Option<Value> {
    let trimmed = strip_fences(text.trim());
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    for (open, close) in [('[', ']'), ('{', '}')] {
        let (Some(from), Some(to)) = (trimmed.find(open), trimmed.rfind(close)) else {
            continue;
        };
        if from < to {
            if let Ok(value) = serde_json::from_str(&trimmed[from..=to]) {
                return Some(value);
            }
        }
    }
    None
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn validate_entry(
    entry: Value,
    entry_index: usize,
    chunk: &Chunk,
    rope: &Rope,
    taxonomy: &Taxonomy,
) -> Result<(Annotation, bool), ParseWarning> {
    let warn = |kind, detail: String| ParseWarning::new(chunk.index, Some(entry_index), kind, detail);

    if !entry.is_object() {
        return Err(warn(
            ParseWarningKind::MalformedEntry,
            format!("entry is not an object: {}", preview(&entry.to_string())),
        ));
    }
    let raw: RawAnnotation = serde_json::from_value(entry)
        .map_err(|e| warn(ParseWarningKind::MalformedEntry, e.to_string()))?;

    let text = raw
        .text
        .filter(|t| !t.is_empty())
        .ok_or_else(|| warn(ParseWarningKind::MalformedEntry, "missing text".to_string()))?;
    let category = raw
        .category
        .ok_or_else(|| warn(ParseWarningKind::MalformedEntry, "missing category".to_string()))?;
    let subtype = raw
        .subtype
        .ok_or_else(|| warn(ParseWarningKind::MalformedEntry, "missing subtype".to_string()))?;

    if !taxonomy.has_category(&category) {
        return Err(warn(
            ParseWarningKind::UnknownCategory,
            format!("unknown category `{category}`"),
        ));
    }
    if !taxonomy.contains(&category, &subtype) {
        return Err(warn(
            ParseWarningKind::UnknownSubtype,
            format!("`{subtype}` is not a subtype of `{category}`"),
        ));
    }

    let confidence = match raw.confidence {
        None => DEFAULT_CONFIDENCE,
        Some(c) if (0.0..=1.0).contains(&c) => c,
        Some(c) => {
            return Err(warn(
                ParseWarningKind::InvalidConfidence,
                format!("confidence {c} outside [0, 1]"),
            ));
        }
    };

    let reported = match (raw.start, raw.end) {
        (Some(s), Some(e)) if s >= 0 && e >= 0 => Some((s as usize, e as usize)),
        _ => None,
    };
    let (start, end, corrected) = match reported {
        Some((s, e)) if span_matches(rope, s, e, &text) => (s, e, false),
        _ => {
            let near = reported.map_or(0, |(s, _)| s);
            let (s, e) = locate(&chunk.text, rope, &text, near).ok_or_else(|| {
                warn(
                    ParseWarningKind::SpanNotFound,
                    format!("`{}` not found in chunk", preview(&text)),
                )
            })?;
            (s, e, true)
        }
    };

    Ok((
        Annotation {
            text,
            category,
            subtype,
            start,
            end,
            confidence,
            source_chunk_index: chunk.index,
        },
        corrected,
    ))
}

fn span_matches(rope: &Rope, start: usize, end: usize, text: &str) -> bool {
    start < end
        && rope
            .get_slice(start..end)
            .is_some_and(|slice| slice == text)
}

/// Literal occurrence of `needle` closest to `near` (earlier wins ties).
fn locate(haystack: &str, rope: &Rope, needle: &str, near: usize) -> Option<(usize, usize)> {
    let needle_chars = needle.chars().count();
    haystack
        .match_indices(needle)
        .map(|(byte, _)| rope.byte_to_char(byte))
        .min_by_key(|&start| start.abs_diff(near))
        .map(|start| (start, start + needle_chars))
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 80;
    if text.chars().count() <= LIMIT {
        text.to_string()
    } else {
        let head: String = text.chars().take(LIMIT).collect();
        format!("{head}…")
    }
}
