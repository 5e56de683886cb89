//! Version ordering for package filenames.
//!
//! The version is cut out of the filename before tokenizing: trailing
//! `.`-separated segments that do not start with a digit (archive extensions)
//! are dropped, then the first `-`-separated segment that starts with a digit
//! is taken. `foo-1.0-py3-none-any.whl` and `foo-1.0.tar.gz` both compare as
//! `1.0`; the full filename only breaks exact ties.

use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Digit run with leading zeros removed, compared by length then lexically
    Number(String),
    Text(String),
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Token::Number(a), Token::Number(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Token::Text(a), Token::Text(b)) => a.cmp(b),
            // Releases sort after pre-release tags: 1.0 > 1.0a
            (Token::Number(_), Token::Text(_)) => Ordering::Greater,
            (Token::Text(_), Token::Number(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A filename keyed by its embedded version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioning {
    full: String,
    tokens: Vec<Token>,
}

impl Versioning {
    pub fn new(filename: &str) -> Self {
        Self {
            full: filename.to_string(),
            tokens: tokenize(extract_version(filename)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl Ord for Versioning {
    fn cmp(&self, other: &Self) -> Ordering {
        // Vec ordering: element-wise, then shorter first
        self.tokens
            .cmp(&other.tokens)
            .then_with(|| self.full.cmp(&other.full))
    }
}

impl PartialOrd for Versioning {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn starts_with_digit(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn extract_version(filename: &str) -> &str {
    let segments: Vec<&str> = filename.split('.').collect();
    let keep = segments
        .iter()
        .rposition(|segment| starts_with_digit(segment))
        .map(|last| last + 1)
        .unwrap_or(segments.len());

    // Byte length of the first `keep` segments joined by '.'
    let end = segments[..keep].iter().map(|s| s.len()).sum::<usize>() + keep.saturating_sub(1);
    let trimmed = &filename[..end];

    trimmed
        .split('-')
        .find(|segment| starts_with_digit(segment))
        .unwrap_or(trimmed)
}

fn tokenize(version: &str) -> Vec<Token> {
    static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();
    let re = TOKEN_REGEX.get_or_init(|| {
        Regex::new(r"[0-9]+|[A-Za-z]+")
            .unwrap_or_else(|e| panic!("Failed to compile version token regex: {}", e))
    });

    re.find_iter(version)
        .map(|m| {
            let token = m.as_str();
            if starts_with_digit(token) {
                let trimmed = token.trim_start_matches('0');
                Token::Number(if trimmed.is_empty() { "0" } else { trimmed }.to_string())
            } else {
                Token::Text(token.to_ascii_lowercase())
            }
        })
        .collect()
}

/// Sort filenames newest first.
pub fn sort_newest_first<T, F>(items: &mut [T], name: F)
where
    F: Fn(&T) -> &str,
{
    items.sort_by_cached_key(|item| std::cmp::Reverse(Versioning::new(name(item))));
}
