//! Inline XML markup: the source text with annotations wrapped around their spans.

use std::fmt::Write as _;

use crate::annotation::Annotation;
use crate::result::AnnotationResult;

use super::char_byte_offsets;

/// Renders the result as an XML document.
///
/// An annotation strictly inside the currently open one is nested. One that
/// crosses an open element's end, or repeats its exact span, cannot be
/// wrapped without breaking well-formedness; it is emitted as a self-closing
/// milestone carrying its text, so stripping all tags still yields the
/// original text.
pub fn to_inline_markup(result: &AnnotationResult) -> String {
    let text = result.text();
    let offsets = char_byte_offsets(text);
    let slice = |from: usize, to: usize| &text[offsets[from]..offsets[to]];

    let mut ordered: Vec<&Annotation> = result.annotations().iter().collect();
    // containers before the spans they contain
    ordered.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut out = String::with_capacity(text.len() * 2);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        out,
        "<annotated_text document_id=\"{}\" source=\"{}\" total_annotations=\"{}\" processing_time=\"{:.3}\" chunk_count=\"{}\">",
        result.document_id(),
        escape_attr(result.source()),
        result.total_annotations(),
        result.processing_time(),
        result.chunk_count(),
    );

    let mut cursor = 0usize;
    let mut open: Vec<&Annotation> = Vec::new();
    for a in ordered {
        while let Some(top) = open.last().copied() {
            if top.end > a.start {
                break;
            }
            escape_text_into(&mut out, slice(cursor, top.end));
            out.push_str("</annotation>");
            cursor = top.end;
            open.pop();
        }
        escape_text_into(&mut out, slice(cursor, a.start));
        cursor = a.start;

        let nests = open.last().map_or(true, |top| top.strictly_contains(a));
        if nests {
            out.push_str(&open_tag(a));
            out.push('>');
            open.push(a);
        } else {
            out.push_str(&open_tag(a));
            let _ = write!(out, " text=\"{}\"/>", escape_attr(&a.text));
        }
    }
    while let Some(top) = open.pop() {
        escape_text_into(&mut out, slice(cursor, top.end));
        out.push_str("</annotation>");
        cursor = top.end;
    }
    escape_text_into(&mut out, slice(cursor, offsets.len() - 1));
    out.push_str("\n</annotated_text>\n");
    out
}

fn open_tag(a: &Annotation) -> String {
    format!(
        "<annotation type=\"{}\" subtype=\"{}\" start=\"{}\" end=\"{}\" confidence=\"{}\"",
        escape_attr(&a.category),
        escape_attr(&a.subtype),
        a.start,
        a.end,
        a.confidence,
    )
}

fn escape_text_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            _ => escape_text_into(&mut out, c.encode_utf8(&mut [0u8; 4])),
        }
    }
    out
}
