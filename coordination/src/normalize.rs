//! Backend output normalization.
//!
//! Backends wrap their JSON in prose, markdown fences, or both. Three
//! strategies are tried in order and the first that yields a JSON object
//! wins:
//!
//! ```text
//! raw text ─▸ direct parse ─▸ fenced ```json block ─▸ brace-matched object
//!                │                  │                         │
//!                └──── Ok ──────────┴──────── Ok ─────────────┘
//!                                   all fail ─▸ NormalizeError::Unparseable (exit 5)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::exit_code;

/// Which strategy produced the JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeStrategy {
    Direct,
    FencedBlock,
    BraceMatched,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("backend output is empty")]
    Empty,
    #[error("no JSON object found in backend output ({len} bytes)")]
    Unparseable { len: usize },
}

impl NormalizeError {
    /// Exit code reported for this failure, distinct from a process failure.
    pub fn exit_code(&self) -> i32 {
        exit_code::UNPARSEABLE_OUTPUT
    }
}

/// Normalized output.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub value: Value,
    pub strategy: NormalizeStrategy,
}

/// Normalize raw backend text into a JSON object.
pub fn normalize_output(raw: &str) -> Result<Normalized, NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }

    if let Some(value) = parse_object(trimmed) {
        return Ok(Normalized {
            value,
            strategy: NormalizeStrategy::Direct,
        });
    }

    if let Some(value) = fenced_blocks(trimmed).find_map(parse_object) {
        return Ok(Normalized {
            value,
            strategy: NormalizeStrategy::FencedBlock,
        });
    }

    if let Some(value) = brace_matched_objects(trimmed)
        .into_iter()
        .find_map(parse_object)
    {
        return Ok(Normalized {
            value,
            strategy: NormalizeStrategy::BraceMatched,
        });
    }

    Err(NormalizeError::Unparseable { len: raw.len() })
}

fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Contents of every ``` fenced block, `json`-tagged blocks first.
fn fenced_blocks(text: &str) -> impl Iterator<Item = &str> {
    let mut tagged = Vec::new();
    let mut untagged = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let (tag, body_start) = match after_open.find('\n') {
            Some(nl) => (after_open[..nl].trim(), nl + 1),
            None => break,
        };
        let body = &after_open[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        let block = &body[..close];
        if tag.eq_ignore_ascii_case("json") {
            tagged.push(block);
        } else {
            untagged.push(block);
        }
        rest = &body[close + 3..];
    }

    tagged.into_iter().chain(untagged)
}

/// Candidate top-level objects found by brace matching, string-aware.
///
/// Greedy: the outermost balanced `{...}` spans are returned in order of
/// appearance, the longest first when spans start at the same offset.
fn brace_matched_objects(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth: usize = 0;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        spans.push(&text[s..=idx]);
                    }
                }
            }
            _ => {}
        }
    }

    // Unbalanced tail: fall back to first '{' .. last '}'.
    if spans.is_empty() {
        if let (Some(s), Some(e)) = (text.find('{'), text.rfind('}')) {
            if s < e {
                spans.push(&text[s..=e]);
            }
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_json() {
        let out = normalize_output(r#"  {"verdict": "APPROVED"}  "#).unwrap();
        assert_eq!(out.strategy, NormalizeStrategy::Direct);
        assert_eq!(out.value["verdict"], "APPROVED");
    }

    #[test]
    fn test_fenced_json_block() {
        let raw = "Here is my review:\n```json\n{\"verdict\": \"CHANGES_REQUIRED\"}\n```\nThanks.";
        let out = normalize_output(raw).unwrap();
        assert_eq!(out.strategy, NormalizeStrategy::FencedBlock);
        assert_eq!(out.value["verdict"], "CHANGES_REQUIRED");
    }

    #[test]
    fn test_json_tag_preferred_over_untagged_block() {
        let raw = "```\n{\"a\": 1}\n```\n```json\n{\"b\": 2}\n```";
        let out = normalize_output(raw).unwrap();
        assert_eq!(out.value["b"], 2);
    }

    #[test]
    fn test_brace_matched_from_prose() {
        let raw = "I think {\"verdict\": \"APPROVED\", \"summary\": \"a } in a string\"} is right.";
        let out = normalize_output(raw).unwrap();
        assert_eq!(out.strategy, NormalizeStrategy::BraceMatched);
        assert_eq!(out.value["summary"], "a } in a string");
    }

    #[test]
    fn test_skips_non_json_braces() {
        let raw = "fn main() { println!() } then {\"ok\": true}";
        let out = normalize_output(raw).unwrap();
        assert_eq!(out.value["ok"], true);
    }

    #[test]
    fn test_array_is_not_an_object() {
        let err = normalize_output("[1, 2, 3]").unwrap_err();
        assert_eq!(err, NormalizeError::Unparseable { len: 9 });
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_garbage_is_unparseable() {
        assert!(matches!(
            normalize_output("the model refused"),
            Err(NormalizeError::Unparseable { .. })
        ));
        assert_eq!(normalize_output("   \n"), Err(NormalizeError::Empty));
    }
}
