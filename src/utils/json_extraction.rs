//! JSON extraction from free-form model replies.
//!
//! Text models asked for "JSON only" still wrap answers in markdown fences or
//! add a sentence before or after. Strategies, in order:
//! 1. ```` ```json ```` fenced block
//! 2. Any fenced block containing an object
//! 3. The largest valid object anywhere in the text (later wins on ties)
//!
//! ```
//! use image_forge::utils::json_extraction::extract_json_object;
//!
//! let reply = "Sure! {\"prompts\": [\"a cat\"], \"analysis\": \"one idea\"}";
//! let json = extract_json_object(reply).unwrap();
//! assert!(json.starts_with("{\"prompts\""));
//! ```

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Error type for JSON extraction failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
    },
    #[error("No JSON content found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").expect("static regex is valid"));

static ANY_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").expect("static regex is valid")
});

/// Extracts the JSON object a model reply most likely meant as its answer.
pub fn extract_json_object(content: &str) -> Result<String, JsonExtractionError> {
    let trimmed = content.trim();

    for fence in [&*JSON_FENCE, &*ANY_FENCE] {
        if let Some(caps) = fence.captures(trimmed) {
            let block = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            if let Some(json) = first_valid_object(block) {
                return Ok(json);
            }
        }
    }

    if let Some(json) = largest_valid_object(trimmed) {
        return Ok(json);
    }

    if let Some(start) = trimmed.find('{') {
        let unclosed_braces = unclosed_braces(&trimmed[start..]);
        if unclosed_braces > 0 {
            return Err(JsonExtractionError::Truncated {
                partial_preview: preview(&trimmed[start..], 100),
                unclosed_braces,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed, 50),
    })
}

/// Finds the index of the `}` matching the `{` at the start of `s`.
///
/// String literals and escape sequences are skipped.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn first_valid_object(block: &str) -> Option<String> {
    let start = block.find('{')?;
    let end = find_matching_brace(&block[start..])?;
    let candidate = &block[start..=start + end];
    is_valid_json(candidate).then(|| candidate.to_string())
}

fn largest_valid_object(content: &str) -> Option<String> {
    content
        .char_indices()
        .filter(|&(_, c)| c == '{')
        .filter_map(|(start, _)| {
            let end = find_matching_brace(&content[start..])?;
            let candidate = &content[start..=start + end];
            is_valid_json(candidate).then_some((start, candidate))
        })
        .max_by(|(pos_a, a), (pos_b, b)| a.len().cmp(&b.len()).then(pos_a.cmp(pos_b)))
        .map(|(_, json)| json.to_string())
}

fn unclosed_braces(s: &str) -> usize {
    let mut depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;
    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth.max(0) as usize
}

fn is_valid_json(candidate: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(candidate).is_ok()
}

fn preview(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_object() {
        let json = extract_json_object(r#"{"prompts": ["a"], "count": 1}"#).expect("extract");
        assert_eq!(json, r#"{"prompts": ["a"], "count": 1}"#);
    }

    #[test]
    fn test_json_fence() {
        let reply = "Here you go:\n```json\n{\"prompts\": [\"a fox\"]}\n```\nEnjoy!";
        assert_eq!(
            extract_json_object(reply).expect("extract"),
            "{\"prompts\": [\"a fox\"]}"
        );
    }

    #[test]
    fn test_generic_fence() {
        let reply = "```\n{\"analysis\": \"ok\"}\n```";
        assert_eq!(
            extract_json_object(reply).expect("extract"),
            "{\"analysis\": \"ok\"}"
        );
    }

    #[test]
    fn test_prefers_largest_object() {
        let reply = r#"Example: {"a": 1}. Answer: {"prompts": ["x", "y"], "analysis": "two"}"#;
        let json = extract_json_object(reply).expect("extract");
        assert!(json.contains("prompts"));
    }

    #[test]
    fn test_braces_inside_strings() {
        let reply = r#"{"prompts": ["a {curly} dragon"], "analysis": "}"}"#;
        assert_eq!(extract_json_object(reply).expect("extract"), reply);
    }

    #[test]
    fn test_truncated() {
        let result = extract_json_object(r#"{"prompts": ["a cat", "a dog""#);
        assert!(matches!(
            result,
            Err(JsonExtractionError::Truncated {
                unclosed_braces: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_not_found() {
        let result = extract_json_object("I cannot help with that.");
        assert!(matches!(result, Err(JsonExtractionError::NotFound { .. })));
    }

    #[test]
    fn test_find_matching_brace() {
        assert_eq!(find_matching_brace(r#"{"a": {"b": 1}} tail"#), Some(14));
        assert_eq!(find_matching_brace("{unclosed"), None);
        assert_eq!(find_matching_brace("}"), None);
    }
}
