//! Tag marker wire format.
//!
//! A marker embeds an identifier inside a fragment's text. The canonical
//! spelling is `{t:AbCdEfGhIj}`; recognition also accepts the angle-bracket
//! spelling `<t:AbCdEfGhIj>`, whitespace around every part, and HTML-entity
//! encoded delimiters (`&#123;`, `&lbrace;`, `&lt;` and their closing forms),
//! which is what rich-text editors tend to produce.
//!
//! The tagger, the extractor and the scope garbage collector all detect
//! markers through this module and nothing else.

use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Length of every identifier embedded in a marker.
pub const HASH_LEN: usize = 10;

const OPEN: &str = r"(?:\{|&#123;|&#x7[bB];|&lbrace;|<|&lt;)";
const CLOSE: &str = r"(?:\}|&#125;|&#x7[dD];|&rbrace;|>|&gt;)";

static MARKER_RE: OnceLock<Regex> = OnceLock::new();

fn marker_regex() -> &'static Regex {
    MARKER_RE.get_or_init(|| {
        let pattern = format!(
            r"{}\s*t\s*:\s*([A-Za-z0-9]{{{}}})\s*{}",
            OPEN, HASH_LEN, CLOSE
        );
        Regex::new(&pattern).expect("marker pattern is a valid regex")
    })
}

/// Format the canonical marker for an identifier.
pub fn format_marker(hash: &str) -> String {
    format!("{{t:{}}}", hash)
}

/// Append a marker to the end of a fragment, separated by a single space.
pub fn append_marker(text: &str, hash: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        format_marker(hash)
    } else {
        format!("{} {}", trimmed, format_marker(hash))
    }
}

/// Whether the fragment carries at least one recognised marker.
pub fn contains_marker(text: &str) -> bool {
    marker_regex().is_match(text)
}

/// Identifier of the first marker in the fragment.
pub fn find_hash(text: &str) -> Option<&str> {
    marker_regex()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Identifiers of every marker in the fragment, in order of appearance.
/// Duplicates are kept.
pub fn find_all(text: &str) -> Vec<&str> {
    marker_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .collect()
}

/// Rewrite every marker naming `old` into the canonical marker for `new`.
/// Markers for other identifiers are left byte-for-byte untouched.
pub fn replace_hash(text: &str, old: &str, new: &str) -> String {
    marker_regex()
        .replace_all(text, |caps: &Captures| {
            if &caps[1] == old {
                format_marker(new)
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Whether a string has the shape of an identifier.
pub fn is_valid_hash(candidate: &str) -> bool {
    candidate.len() == HASH_LEN && candidate.bytes().all(|b| b.is_ascii_alphanumeric())
}
