//! Prompt sanitization.
//!
//! # Responsibilities
//! - Reject prompts carrying script URLs or mostly-markup payloads
//! - Strip tags and inline script calls
//! - Normalize whitespace and enforce the length limit
//!
//! # Design Decisions
//! - Fail closed: anything that looks like an injection vector is rejected
//! - Truncation happens at a word boundary and is marked with `...`

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Shortest prompt accepted after cleaning.
const MIN_PROMPT_CHARS: usize = 3;

/// Markup may make up at most this share of the raw prompt.
const MAX_MARKUP_RATIO: f64 = 0.2;

static DANGEROUS_SCHEMES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)javascript:|vbscript:|data:text/html").expect("DANGEROUS_SCHEMES regex should compile")
});

static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<script[^>]*>").expect("SCRIPT_TAG regex should compile"));

static HTML_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--").expect("HTML_COMMENT regex should compile"));

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("HTML_TAG regex should compile"));

static SCRIPT_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:alert|confirm|prompt|eval|exec)\s*\(").expect("SCRIPT_CALL regex should compile")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("WHITESPACE regex should compile"));

/// Why a prompt was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptError {
    #[error("Prompt cannot be empty")]
    Empty,

    #[error("Prompt contains potentially dangerous content")]
    DangerousContent,

    #[error("Prompt too short after sanitization")]
    TooShort,
}

/// Clean `prompt` for forwarding to backends.
pub fn sanitize_prompt(prompt: &str, max_length: usize) -> Result<String, PromptError> {
    if prompt.is_empty() {
        return Err(PromptError::Empty);
    }

    if DANGEROUS_SCHEMES.is_match(prompt) {
        return Err(PromptError::DangerousContent);
    }

    let total = prompt.len() as f64;
    for pattern in [&*SCRIPT_TAG, &*HTML_COMMENT] {
        let markup: usize = pattern.find_iter(prompt).map(|m| m.len()).sum();
        if markup as f64 / total > MAX_MARKUP_RATIO {
            return Err(PromptError::DangerousContent);
        }
    }

    let stripped = HTML_TAG.replace_all(prompt, "");
    let stripped = SCRIPT_CALL.replace_all(&stripped, "");
    let mut sanitized = WHITESPACE.replace_all(&stripped, " ").trim().to_string();

    let length = sanitized.chars().count();
    if length > max_length {
        tracing::warn!(from = length, to = max_length, "Prompt truncated");
        sanitized = truncate_at_word(&sanitized, max_length);
    }

    if sanitized.chars().count() < MIN_PROMPT_CHARS {
        return Err(PromptError::TooShort);
    }

    tracing::debug!(from = prompt.len(), to = sanitized.len(), "Prompt sanitized");
    Ok(sanitized)
}

/// First `max_chars` characters, cut back to the last space, plus `...`.
fn truncate_at_word(text: &str, max_chars: usize) -> String {
    let end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..end];
    let head = head.rsplit_once(' ').map(|(before, _)| before).unwrap_or(head);
    format!("{head}...")
}
