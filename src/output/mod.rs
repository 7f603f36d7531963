//! Pure serializations of an [`AnnotationResult`](crate::AnnotationResult)
//! and the file writer that persists them.

mod markup;
mod record;
mod table;
mod write;

pub use markup::to_inline_markup;
pub use record::{to_record, RecordEntry, RecordMetadata, StructuredRecord};
pub use table::{to_rows, write_parquet, TableRow};
pub use write::{write_outputs, OutputPaths};

/// Byte offset of every char boundary in `text`, including the end.
fn char_byte_offsets(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(byte, _)| byte)
        .chain(std::iter::once(text.len()))
        .collect()
}


#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::tests_support::result_with;
    use super::*;

    const TEXT: &str = "Señor Dios, es bueno & <verdadero>. Amen dixo el rey.";
    const LABELS: [(&str, &str); 4] = [
        ("Lexis", "authority"),
        ("Lexis", "religious"),
        ("Notes", "ambiguity"),
        ("Rhetoric", "formula"),
    ];

    #[test]
    fn offsets_include_end_and_skip_continuation_bytes() {
        assert_eq!(char_byte_offsets("añb"), vec![0, 1, 3, 4]);
        assert_eq!(char_byte_offsets(""), vec![0]);
    }

    fn strip_tags(s: &str) -> String {
        let mut out = String::new();
        let mut in_tag = false;
        for c in s.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                _ if !in_tag => out.push(c),
                _ => {}
            }
        }
        out.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
    }

    proptest! {
        #[test]
        fn every_format_reports_the_same_annotations(
            raw in prop::collection::vec((0usize..52, 1usize..12, 0usize..4), 0..12)
        ) {
            let len = TEXT.chars().count();
            let spans: Vec<(usize, usize, &str, &str)> = raw
                .into_iter()
                .map(|(start, width, label)| {
                    let end = (start + width).min(len);
                    (start, end, LABELS[label].0, LABELS[label].1)
                })
                .collect();
            let result = result_with(TEXT, &spans);
            let total = result.total_annotations();

            let markup = to_inline_markup(&result);
            prop_assert_eq!(markup.matches("<annotation ").count(), total);
            prop_assert_eq!(to_rows(&result).len(), total);
            let record = to_record(&result);
            prop_assert_eq!(record.annotations.len(), total);
            prop_assert_eq!(record.metadata.total_annotations, total);
            prop_assert_eq!(result.statistics().total_annotations, total);

            let body_start = markup.find("\">\n").unwrap() + 3;
            let body_end = markup.rfind("\n</annotated_text>").unwrap();
            prop_assert_eq!(strip_tags(&markup[body_start..body_end]), TEXT);
        }
    }
}
