//! Per-attempt upstream errors
//!
//! One `AttemptError` is produced for every failed call to an upstream. Its
//! classification decides whether the proxy rotates to another key or hands
//! the failure straight back to the client.

use provider::ErrorClassification;
use thiserror::Error;

use crate::proxy::UpstreamReply;

/// Failure of a single upstream attempt with one key.
#[derive(Error, Debug)]
pub enum AttemptError {
    /// Upstream answered with a 4xx/5xx status
    #[error("upstream returned {}: {}", .0.status, .0.body_text())]
    Upstream(UpstreamReply),

    /// Request never produced a complete response (connect, timeout, body read)
    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The key cannot be encoded as a header value
    #[error("key is not a valid header value: {0}")]
    InvalidKey(String),
}

impl AttemptError {
    /// Rotation decision for this failure.
    ///
    /// Upstream statuses go through `classify_status` (status first, body text
    /// second). Transport errors, timeouts included, never rotate. A key that
    /// is not a valid header value is as unusable as a revoked one.
    pub fn classification(&self) -> ErrorClassification {
        match self {
            AttemptError::Upstream(reply) => {
                provider::classify_status(reply.status.as_u16(), &reply.body_text())
            }
            AttemptError::Transport(_) => ErrorClassification::Other,
            AttemptError::InvalidKey(_) => ErrorClassification::Auth,
        }
    }
}
