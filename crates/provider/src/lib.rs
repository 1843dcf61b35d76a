//! Provider error classification
//!
//! Sorts failures returned by credentialed providers (LLM, avatar, speech) into
//! the categories that drive key rotation:
//! - `Quota`: the key is temporarily exhausted (quota, rate limit, billing)
//! - `Auth`: the key itself was rejected (invalid, revoked, forbidden)
//! - `Other`: anything else, which is never retried with another key
//!
//! Classification is a heuristic over rendered error text. Providers change
//! their error wording without notice, so callers that can see a structured
//! status should go through `classify_status`, which only falls back to text
//! matching when the status says nothing.

pub mod patterns;

pub use patterns::{AUTH_PATTERNS, QUOTA_PATTERNS, classify, classify_status, is_auth_error, is_quota_error};

use std::fmt::Display;

/// Classification of a provider failure to decide between rotation and propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    /// Quota or rate limit hit on this key; rotate to the next one
    Quota,
    /// Key rejected by the provider; rotate to the next one
    Auth,
    /// Not a credential problem; propagate to the caller unchanged
    Other,
}

impl ErrorClassification {
    /// Label for logs, metrics and exhaustion reasons.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Quota => "quota_error",
            ErrorClassification::Auth => "auth_error",
            ErrorClassification::Other => "other",
        }
    }

    /// Whether switching to another key can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClassification::Quota | ErrorClassification::Auth)
    }
}

/// Maps a provider's error type to an `ErrorClassification`.
///
/// Implementations are swappable per provider: one backed by structured status
/// codes where the SDK exposes them, `SubstringClassifier` everywhere else.
pub trait ErrorClassifier<E: ?Sized>: Send + Sync {
    fn classify(&self, err: &E) -> ErrorClassification;
}

/// Default classifier: lowercase substring matching on the rendered error.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstringClassifier;

impl<E: Display + ?Sized> ErrorClassifier<E> for SubstringClassifier {
    fn classify(&self, err: &E) -> ErrorClassification {
        patterns::classify(err)
    }
}

impl<E: ?Sized, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> ErrorClassification + Send + Sync,
{
    fn classify(&self, err: &E) -> ErrorClassification {
        self(err)
    }
}
