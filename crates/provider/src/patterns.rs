//! Error text patterns for quota and credential failures
//!
//! Providers return heterogeneous error shapes (HTTP status text, SDK exception
//! messages, JSON bodies). Matching lowercase substrings of the rendered error
//! is the one approach that works across all of them without provider-specific
//! parsing. It is also fragile: a provider rewording its errors silently turns
//! a rotatable failure into `Other`.

use std::fmt::Display;

use tracing::trace;

use crate::ErrorClassification;

/// Substrings indicating the key has run out of quota or is rate limited.
pub const QUOTA_PATTERNS: &[&str] = &[
    "quota exceeded",
    "rate limit exceeded",
    "too many requests",
    "resource exhausted",
    "daily limit exceeded",
    "monthly limit exceeded",
    "429",
    "limit exceeded",
    "usage limit",
    "billing",
];

/// Substrings indicating the key is invalid, expired or forbidden.
pub const AUTH_PATTERNS: &[&str] = &[
    "invalid api key",
    "authentication failed",
    "unauthorized",
    "401",
    "403",
    "api key not valid",
    "invalid key",
];

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    let lower = text.to_lowercase();
    patterns.iter().any(|pattern| lower.contains(pattern))
}

/// True if the rendered error looks like quota or rate-limit exhaustion.
pub fn is_quota_error<E: Display + ?Sized>(err: &E) -> bool {
    matches_any(&err.to_string(), QUOTA_PATTERNS)
}

/// True if the rendered error looks like a rejected key.
pub fn is_auth_error<E: Display + ?Sized>(err: &E) -> bool {
    matches_any(&err.to_string(), AUTH_PATTERNS)
}

/// Classify a rendered error. Quota is checked before auth.
pub fn classify<E: Display + ?Sized>(err: &E) -> ErrorClassification {
    let text = err.to_string();
    if matches_any(&text, QUOTA_PATTERNS) {
        ErrorClassification::Quota
    } else if matches_any(&text, AUTH_PATTERNS) {
        ErrorClassification::Auth
    } else {
        ErrorClassification::Other
    }
}

/// Classify an upstream HTTP error by status, falling back to the body text.
///
/// 429 is always `Quota` and 401/403 always `Auth`, whatever the body says.
/// Other statuses defer to the text patterns, which catches providers that
/// report quota exhaustion as 400 or 402 with a descriptive message.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    let classification = match status {
        429 => ErrorClassification::Quota,
        401 | 403 => ErrorClassification::Auth,
        _ => classify(body),
    };
    trace!(status, classification = classification.label(), "classified upstream status");
    classification
}
