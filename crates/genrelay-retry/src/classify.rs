//! Raw-error classification into the failure taxonomy.
//!
//! Each provider surfaces failures with different message shapes. The
//! default classifier checks known substrings, most specific category first;
//! provider adapters that already know the category can bypass it by
//! returning a typed `GenError` inside the error chain.

use std::time::Duration;

use genrelay_core::ErrorCategory;

/// Result of classifying one raw error.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub category: ErrorCategory,
    /// Provider-supplied retry-after, when the message carries one.
    pub retry_after: Option<Duration>,
}

/// Maps an unclassified provider error to a category.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &anyhow::Error) -> Classification;
}

const AUTH_PATTERNS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "invalid api key",
    "authentication",
];

const SAFETY_PATTERNS: &[&str] = &[
    "safety",
    "content policy",
    "content_filter",
    "prohibited content",
];

const QUOTA_PATTERNS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota",
    "resource exhausted",
    "resource_exhausted",
    "overloaded",
    "529",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

const PARSE_PATTERNS: &[&str] = &[
    "unexpected token",
    "unexpected end",
    "eof while parsing",
    "truncat",
    "invalid json",
    "malformed",
    "expected value",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "connection reset",
    "connection refused",
    "broken pipe",
    "temporarily",
];

/// Substring-based classifier over the whole error chain.
pub struct PatternClassifier;

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, error: &anyhow::Error) -> Classification {
        let message = format!("{error:#}").to_lowercase();

        let category = if matches_any(&message, AUTH_PATTERNS) {
            ErrorCategory::Auth
        } else if matches_any(&message, SAFETY_PATTERNS) {
            ErrorCategory::Safety
        } else if matches_any(&message, QUOTA_PATTERNS) {
            ErrorCategory::Quota
        } else if matches_any(&message, PARSE_PATTERNS) {
            ErrorCategory::RetryableParse
        } else if matches_any(&message, TIMEOUT_PATTERNS) {
            ErrorCategory::Timeout
        } else if matches_any(&message, TRANSIENT_PATTERNS) {
            ErrorCategory::RetryableTransient
        } else {
            // Unknown shapes are permanent: guessing "transient" would hammer
            // a provider with retries of a request that can never succeed.
            ErrorCategory::NonRetryable
        };

        Classification {
            category,
            retry_after: parse_retry_after(&message),
        }
    }
}

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| message.contains(p))
}

/// Pull a retry-after duration out of message text, accepting the common
/// `retry after 12s`, `retry-after: 12` and `retry in 12 seconds` shapes.
fn parse_retry_after(message: &str) -> Option<Duration> {
    for marker in ["retry-after:", "retry after", "retry in"] {
        let Some(pos) = message.find(marker) else {
            continue;
        };
        let rest = message[pos + marker.len()..].trim_start();
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(secs) = digits.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
    }
    None
}
