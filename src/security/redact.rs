//! Redaction of secrets in error text.
//!
//! Backend error bodies can echo credentials back. Everything that reaches a
//! log line or an HTTP response passes through [`redact`] first.

use std::sync::LazyLock;

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

static SENSITIVE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"sk-[a-zA-Z0-9-]{6,}",
        r#"(?i)password["\s]*[:=]["\s]*[^\s"]+"#,
        r#"(?i)token["\s]*[:=]["\s]*[^\s"]+"#,
        r#"(?i)secret["\s]*[:=]["\s]*[^\s"]+"#,
        r"(?i)bearer\s+[a-zA-Z0-9._~+/=-]+",
        r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b",
        r"\b\d{3}-\d{2}-\d{4}\b",
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("redaction regex should compile"))
    .collect()
});

/// Replace credentials and personal data in `message` with `[REDACTED]`.
pub fn redact(message: &str) -> String {
    SENSITIVE
        .iter()
        .fold(message.to_string(), |text, pattern| {
            pattern.replace_all(&text, REDACTED).into_owned()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_api_keys_and_credentials() {
        let message = "invalid key sk-or-v1-abcdef123456 for user bob@example.com, password=hunter2";
        let redacted = redact(message);
        assert!(!redacted.contains("sk-or-v1"));
        assert!(!redacted.contains("bob@example.com"));
        assert!(!redacted.contains("hunter2"));
        assert!(redacted.starts_with("invalid key [REDACTED]"));
    }

    #[test]
    fn test_redacts_bearer_tokens() {
        assert_eq!(redact("Authorization: Bearer abc.def-ghi"), "Authorization: [REDACTED]");
    }

    #[test]
    fn test_leaves_ordinary_text_alone() {
        let message = "rate limit exceeded: retry later";
        assert_eq!(redact(message), message);
    }
}
