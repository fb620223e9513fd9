//! Shrinks page records until their JSON form fits a delivery record.
//!
//! The longer of `page_text` / `page_links` loses one trailing whitespace-delimited
//! token per step. Size is tracked incrementally from the escaped length of each
//! removed suffix and confirmed by a full serialization at the end, so a large page
//! is not re-serialized once per token.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    pub domain: String,
    pub url: String,
    pub job_tag: String,
    pub timestamp: String,
    pub page_text: String,
    pub page_links: String,
}

impl PageRecord {
    pub fn serialized_len(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedRecord {
    pub record: PageRecord,
    pub original_size: usize,
    pub final_size: usize,
    pub truncated: bool,
}

#[derive(Clone, Copy)]
enum Field {
    Text,
    Links,
}

/// Returns the record shrunk to at most `ceiling` serialized bytes.
///
/// Terminates after at most one step per token plus one per field, or as soon as
/// a step removes nothing. A whitespace-only field has no tokens but still takes a
/// step to clear. When the ceiling is below the metadata overhead the result
/// has both fields empty and still exceeds it.
pub fn bound(record: PageRecord, ceiling: usize) -> BoundedRecord {
    let original_size = record.serialized_len();
    if original_size <= ceiling {
        return BoundedRecord { record, original_size, final_size: original_size, truncated: false };
    }

    let mut record = record;
    let mut size = original_size;
    let max_steps = token_count(&record.page_text) + token_count(&record.page_links) + 2;

    for _ in 0..max_steps {
        if size <= ceiling {
            // Incremental sizes are exact for JSON strings; confirm anyway.
            size = record.serialized_len();
            if size <= ceiling {
                break;
            }
        }

        let field = match (record.page_text.is_empty(), record.page_links.is_empty()) {
            (true, true) => break,
            (false, true) => Field::Text,
            (true, false) => Field::Links,
            (false, false) if record.page_text.len() > record.page_links.len() => Field::Text,
            (false, false) => Field::Links,
        };
        let target = match field {
            Field::Text => &mut record.page_text,
            Field::Links => &mut record.page_links,
        };

        let removed = drop_last_token(target);
        if removed.is_empty() {
            break;
        }
        size = size.saturating_sub(escaped_len(&removed));
    }

    let final_size = record.serialized_len();
    if final_size != original_size {
        tracing::warn!(
            job_tag = %record.job_tag,
            url = %record.url,
            original_size,
            final_size,
            "delivery record truncated"
        );
    }

    BoundedRecord { record, original_size, final_size, truncated: final_size != original_size }
}

/// Removes the last token together with the whitespace before it; returns what was cut.
fn drop_last_token(field: &mut String) -> String {
    let content_end = field.trim_end().len();
    let token_start = field[..content_end]
        .rfind(char::is_whitespace)
        .map(|i| i + field[i..].chars().next().map(char::len_utf8).unwrap_or(1))
        .unwrap_or(0);
    let cut = field[..token_start].trim_end().len();
    field.split_off(cut)
}

fn token_count(field: &str) -> usize {
    field.split_whitespace().count()
}

/// Length of `s` inside a JSON string literal.
fn escaped_len(s: &str) -> usize {
    serde_json::to_string(s).map(|q| q.len().saturating_sub(2)).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str, links: &str) -> PageRecord {
        PageRecord {
            domain: "example.com".to_string(),
            url: "http://web.archive.org/web/20190101000000/example.com/".to_string(),
            job_tag: "t".to_string(),
            timestamp: "2019-01-01T00:00:00".to_string(),
            page_text: text.to_string(),
            page_links: links.to_string(),
        }
    }

    #[test]
    fn test_under_ceiling_is_untouched() {
        let input = record("hello world", "http://a.com");
        let bounded = bound(input.clone(), 1000);
        assert_eq!(bounded.record, input);
        assert!(!bounded.truncated);
        assert_eq!(
            serde_json::to_string(&bounded.record).unwrap(),
            serde_json::to_string(&input).unwrap()
        );
    }

    #[test]
    fn test_fifty_bytes_over_fits_after_bound() {
        let base = record("", "").serialized_len();
        let words = "word ".repeat((1050 - base) / 5 + 1);
        let mut input = record(words.trim_end(), "");
        while input.serialized_len() < 1050 {
            input.page_text.push('x');
        }
        while input.serialized_len() > 1050 {
            input.page_text.pop();
        }
        assert_eq!(input.serialized_len(), 1050);

        let bounded = bound(input, 1000);
        assert!(bounded.truncated);
        assert!(bounded.final_size <= 1000);
        assert_eq!(bounded.record.serialized_len(), bounded.final_size);
        assert_eq!(bounded.original_size, 1050);
    }

    #[test]
    fn test_shrinks_longer_field_first() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let links = "http://a.com";
        let input = record(text, links);
        let ceiling = input.serialized_len() - 5;
        let bounded = bound(input, ceiling);
        assert_eq!(bounded.record.page_links, links);
        assert_eq!(bounded.record.page_text, "alpha beta gamma delta epsilon zeta eta");
    }

    #[test]
    fn test_escaped_characters_are_counted() {
        let text = "\"q\" \"q\" \"q\" \"q\" \"q\" \"q\" \"q\" \"q\" \"q\" \"q\"";
        let input = record(text, "");
        let ceiling = input.serialized_len() - 10;
        let bounded = bound(input, ceiling);
        assert!(bounded.final_size <= ceiling);
    }

    #[test]
    fn test_degrades_to_empty_fields() {
        let bounded = bound(record("a b c", "d e"), 10);
        assert_eq!(bounded.record.page_text, "");
        assert_eq!(bounded.record.page_links, "");
        assert!(bounded.truncated);
    }

    #[test]
    fn test_whitespace_only_fields_are_cleared() {
        let input = record(&" ".repeat(2000), &"\t".repeat(2000));
        let bounded = bound(input, 1000);
        assert!(bounded.final_size <= 1000, "final size {}", bounded.final_size);
        assert_eq!(bounded.record.page_text, "");
        assert_eq!(bounded.record.page_links, "");
        assert!(bounded.truncated);
    }

    #[test]
    fn test_single_giant_token() {
        let input = record(&"x".repeat(5000), "");
        let bounded = bound(input, 1000);
        assert_eq!(bounded.record.page_text, "");
        assert!(bounded.final_size <= 1000);
    }

    #[test]
    fn test_drop_last_token() {
        let mut field = "one two\nthree  ".to_string();
        assert_eq!(drop_last_token(&mut field), "\nthree  ");
        assert_eq!(field, "one two");
        let mut single = "solo".to_string();
        assert_eq!(drop_last_token(&mut single), "solo");
        assert!(single.is_empty());
        let mut empty = String::new();
        assert_eq!(drop_last_token(&mut empty), "");
    }
}
