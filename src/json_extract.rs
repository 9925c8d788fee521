//! Tolerant JSON extraction from raw model output.
//!
//! Models wrap JSON in prose, code fences, or partial truncation fairly
//! often. Rather than treating that as fatal, every stage handler that
//! expects structured output runs the raw text through
//! [`extract_json`] first. Failure degrades to a `rawText` sentinel instead
//! of propagating an error, mirroring the graceful-degradation idiom
//! `cloudllm::context_strategy::parse_refs` applies to malformed model
//! output (best-effort line scanning, never a panic).

use serde_json::Value;

/// Outcome of attempting to pull structured JSON out of free-form model
/// text.
#[derive(Debug, Clone)]
pub enum ExtractedJson {
    /// Extraction and parsing succeeded.
    Parsed(Value),
    /// Extraction failed; callers should fall back to treating the stage
    /// output as unstructured text, carrying the original text through in
    /// `data.rawText`.
    RawText(String),
}

impl ExtractedJson {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ExtractedJson::Parsed(v) => Some(v),
            ExtractedJson::RawText(_) => None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, ExtractedJson::Parsed(_))
    }
}

/// Attempts, in order: a whole-string parse, a fenced ```json block, then a
/// scan for the first balanced `{...}` or `[...]` span. Returns
/// [`ExtractedJson::RawText`] if nothing parses.
pub fn extract_json(raw: &str) -> ExtractedJson {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return ExtractedJson::Parsed(v);
    }
    if let Some(fenced) = extract_fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(&fenced) {
            return ExtractedJson::Parsed(v);
        }
    }
    if let Some(span) = find_balanced_span(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(&span) {
            return ExtractedJson::Parsed(v);
        }
    }
    ExtractedJson::RawText(raw.to_string())
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let start_marker_positions = ["```json", "```JSON", "```"];
    for marker in start_marker_positions {
        if let Some(start) = text.find(marker) {
            let after = &text[start + marker.len()..];
            if let Some(end) = after.find("```") {
                let body = after[..end].trim();
                if !body.is_empty() {
                    return Some(body.to_string());
                }
            }
        }
    }
    None
}

/// Scans for the first `{`/`[` and returns the text up through its
/// matching closing brace/bracket, tracking string literals so braces
/// inside quoted text don't confuse the scan.
fn find_balanced_span(text: &str) -> Option<String> {
    let bytes: Vec<char> = text.chars().collect();
    let start = bytes.iter().position(|&c| c == '{' || c == '[')?;
    let open = bytes[start];
    let close = if open == '{' { '}' } else { ']' };
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let span: String = bytes[start..=i].iter().collect();
                    return Some(span);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let result = extract_json(r#"{"queries": ["a", "b"]}"#);
        assert!(result.is_parsed());
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "Here is my plan:\n```json\n{\"queries\": [\"a\"]}\n```\nDone.";
        let result = extract_json(raw);
        assert!(result.is_parsed());
        assert_eq!(result.as_value().unwrap()["queries"][0], "a");
    }

    #[test]
    fn parses_embedded_json_with_prose_around_it() {
        let raw = "Sure, here's the analysis: {\"queries\": [\"a\", \"b\"]} -- hope that helps!";
        let result = extract_json(raw);
        assert!(result.is_parsed());
    }

    #[test]
    fn ignores_braces_inside_string_literals() {
        let raw = r#"{"text": "a { nested } brace", "queries": ["a"]}"#;
        let result = extract_json(raw);
        assert!(result.is_parsed());
        assert_eq!(result.as_value().unwrap()["text"], "a { nested } brace");
    }

    #[test]
    fn falls_back_to_raw_text_on_total_garbage() {
        let result = extract_json("not json at all, sorry");
        match result {
            ExtractedJson::RawText(text) => assert_eq!(text, "not json at all, sorry"),
            ExtractedJson::Parsed(_) => panic!("expected raw text fallback"),
        }
    }

    #[test]
    fn falls_back_on_truncated_json() {
        let result = extract_json(r#"{"queries": ["a", "b""#);
        assert!(!result.is_parsed());
    }
}
