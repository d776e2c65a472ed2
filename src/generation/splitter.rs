//! Local, pattern-based prompt splitting.

use std::sync::LazyLock;

use regex::Regex;

use super::types::SplitOutcome;

/// Fragments must be longer than this to count as a prompt.
const MIN_FRAGMENT_CHARS: usize = 5;
/// Plain lines must be longer than this when no list markers are present.
const MIN_LINE_CHARS: usize = 10;

/// A numbered (`1.`, `2)`) or bulleted (`•`, `-`, `*`) list line.
static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\d+[.)]|[•*-])\s*(.+?)\s*$").expect("static regex is valid")
});

/// Splits text into prompts using numbered and bulleted list markers.
///
/// Numbered (`1.`, `2)`) and bulleted (`•`, `-`, `*`) lines become prompts
/// with their markers stripped. Text without any list markers falls back to
/// one prompt per sufficiently long line. Duplicates are dropped, first
/// occurrence wins.
pub fn pattern_split(text: &str) -> SplitOutcome {
    let mut prompts: Vec<String> = Vec::new();

    for line in text.lines() {
        if let Some(caps) = LIST_ITEM.captures(line) {
            let fragment = caps[1].trim();
            if fragment.chars().count() > MIN_FRAGMENT_CHARS {
                push_unique(&mut prompts, fragment);
            }
        }
    }

    if prompts.is_empty() {
        for line in text.lines().map(str::trim) {
            if line.chars().count() > MIN_LINE_CHARS {
                push_unique(&mut prompts, line);
            }
        }
    }

    let summary = format!("Split by pattern matching, found {} prompt(s)", prompts.len());
    SplitOutcome { prompts, summary }
}

fn push_unique(prompts: &mut Vec<String>, candidate: &str) {
    if !prompts.iter().any(|p| p == candidate) {
        prompts.push(candidate.to_string());
    }
}
