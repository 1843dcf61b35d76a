//! Bounded retry loop that rotates keys on credential failures
//!
//! Wraps one outbound call to a credentialed provider:
//!
//! ```text
//! get_key ──► call ──► Ok ─────────────────────────────► success
//!              │
//!              └─ Err ─► classify
//!                         ├─ Other ───────────────────► Fatal (no mark, no retry)
//!                         └─ Quota/Auth ─► mark_exhausted
//!                                           ├─ attempts used up ─► ExhaustedAllKeys
//!                                           ├─ get_key = None ───► ExhaustedAllKeys
//!                                           └─ get_key = Some ───► call again
//! ```
//!
//! Timeouts are not credential failures and propagate as `Fatal` like any
//! other unclassified error.

use std::future::Future;

use provider::ErrorClassifier;
use tracing::{debug, info, warn};

use crate::ApiKey;
use crate::pool::KeyPool;

/// Attempts per call, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Soft message shown to the end user when every key is exhausted.
pub const DEGRADED_MESSAGE: &str =
    "I'm experiencing high demand right now. Please try again in a little while.";

/// Retry bounds for `call_with_rotation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// A policy with `max_attempts` total calls. Zero is treated as one.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

/// Terminal failures of `call_with_rotation`.
#[derive(Debug, thiserror::Error)]
pub enum RotationError<E> {
    /// No usable key remained, or the attempt budget ran out on credential
    /// failures. Recoverable: surface `DEGRADED_MESSAGE` instead of crashing.
    #[error("all '{class}' keys exhausted after {attempts} attempt(s)")]
    ExhaustedAllKeys {
        class: String,
        attempts: u32,
        /// Error from the final attempt, if any call was made.
        last: Option<E>,
    },

    /// The call failed for a reason rotating keys cannot fix.
    #[error("{0}")]
    Fatal(E),
}

impl<E> RotationError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RotationError::ExhaustedAllKeys { .. })
    }

    /// User-facing text for the degraded outcome; `None` for fatal errors,
    /// which belong to the caller's own error handling.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            RotationError::ExhaustedAllKeys { .. } => Some(DEGRADED_MESSAGE),
            RotationError::Fatal(_) => None,
        }
    }

    /// The original error of a fatal failure.
    pub fn into_fatal(self) -> Option<E> {
        match self {
            RotationError::Fatal(err) => Some(err),
            RotationError::ExhaustedAllKeys { .. } => None,
        }
    }
}

/// Run `call` with a key from `class`, rotating to the next key on quota or
/// auth failures for at most `policy.max_attempts` calls.
///
/// Each failed key is marked exhausted before the next one is requested, so a
/// pool of two keys yields at most two calls even when the budget is larger.
pub async fn call_with_rotation<T, E, F, Fut, C>(
    pool: &KeyPool,
    class: &str,
    policy: RetryPolicy,
    classifier: &C,
    mut call: F,
) -> Result<T, RotationError<E>>
where
    F: FnMut(ApiKey) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: ErrorClassifier<E> + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);

    let Some(mut key) = pool.get_key(class) else {
        return Err(RotationError::ExhaustedAllKeys {
            class: class.to_string(),
            attempts: 0,
            last: None,
        });
    };

    let mut attempt = 0u32;
    loop {
        let err = match call(key.clone()).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(class, attempts = attempt + 1, "call succeeded after key rotation");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let classification = classifier.classify(&err);
        if !classification.is_retryable() {
            debug!(class, attempt = attempt + 1, "provider error not credential related, propagating");
            return Err(RotationError::Fatal(err));
        }

        pool.mark_exhausted(class, &key, classification.label());

        if attempt + 1 >= max_attempts {
            warn!(class, attempts = attempt + 1, "retry budget spent on credential failures");
            return Err(RotationError::ExhaustedAllKeys {
                class: class.to_string(),
                attempts: attempt + 1,
                last: Some(err),
            });
        }

        match pool.get_key(class) {
            Some(next) => {
                warn!(
                    class,
                    attempt = attempt + 1,
                    classification = classification.label(),
                    "rotating to next key"
                );
                key = next;
                attempt += 1;
            }
            None => {
                return Err(RotationError::ExhaustedAllKeys {
                    class: class.to_string(),
                    attempts: attempt + 1,
                    last: Some(err),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CredentialClass;
    use provider::{ErrorClassification, SubstringClassifier};

    fn pool_with(keys: &[&str]) -> KeyPool {
        KeyPool::builder()
            .class(CredentialClass::google(), keys.iter().copied())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn two_keys_always_quota_stops_after_two_calls() {
        let pool = pool_with(&["a", "b"]);
        let mut seen = Vec::new();

        let result: Result<(), _> = call_with_rotation(
            &pool,
            "google",
            RetryPolicy::new(3),
            &SubstringClassifier,
            |key| {
                seen.push(key.expose().clone());
                async { Err::<(), String>("429 Too Many Requests".to_string()) }
            },
        )
        .await;

        assert_eq!(seen, vec!["a", "b"]);
        match result {
            Err(RotationError::ExhaustedAllKeys {
                class,
                attempts,
                last,
            }) => {
                assert_eq!(class, "google");
                assert_eq!(attempts, 2);
                assert_eq!(last.as_deref(), Some("429 Too Many Requests"));
            }
            other => panic!("expected ExhaustedAllKeys, got {other:?}"),
        }
        assert_eq!(pool.status_of("google").unwrap().available, 0);
    }

    #[tokio::test]
    async fn unclassified_error_propagates_without_marking() {
        let pool = pool_with(&["a", "b"]);
        let mut calls = 0;

        let result: Result<(), _> = call_with_rotation(
            &pool,
            "google",
            RetryPolicy::default(),
            &SubstringClassifier,
            |_key| {
                calls += 1;
                async { Err::<(), String>("connection refused".to_string()) }
            },
        )
        .await;

        assert_eq!(calls, 1);
        let err = result.unwrap_err();
        assert!(!err.is_exhausted());
        assert!(err.user_message().is_none());
        assert_eq!(err.into_fatal().as_deref(), Some("connection refused"));

        let status = pool.status_of("google").unwrap();
        assert_eq!(status.ever_exhausted, 0);
        assert_eq!(status.available, 2);
    }

    #[tokio::test]
    async fn succeeds_on_second_key_after_quota_error() {
        let pool = pool_with(&["a", "b", "c"]);

        let result = call_with_rotation(
            &pool,
            "google",
            RetryPolicy::default(),
            &SubstringClassifier,
            |key| async move {
                if key.expose() == "a" {
                    Err("RESOURCE_EXHAUSTED: quota exceeded".to_string())
                } else {
                    Ok(format!("answered with {}", key.expose()))
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "answered with b");
        assert!(!pool.is_available("google", &ApiKey::from("a")));
        assert!(pool.is_available("google", &ApiKey::from("b")));
    }

    #[tokio::test]
    async fn auth_errors_rotate_like_quota_errors() {
        let pool = pool_with(&["revoked", "good"]);

        let result = call_with_rotation(
            &pool,
            "google",
            RetryPolicy::default(),
            &SubstringClassifier,
            |key| async move {
                match key.expose().as_str() {
                    "revoked" => Err("Invalid API key provided".to_string()),
                    _ => Ok(()),
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert!(!pool.is_available("google", &ApiKey::from("revoked")));
    }

    #[tokio::test]
    async fn attempt_budget_caps_calls_even_with_spare_keys() {
        let pool = pool_with(&["a", "b", "c", "d", "e"]);
        let mut calls = 0;

        let result: Result<(), _> = call_with_rotation(
            &pool,
            "google",
            RetryPolicy::new(3),
            &SubstringClassifier,
            |_key| {
                calls += 1;
                async { Err::<(), String>("billing account suspended".to_string()) }
            },
        )
        .await;

        assert_eq!(calls, 3);
        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.user_message(), Some(DEGRADED_MESSAGE));

        let status = pool.status_of("google").unwrap();
        assert_eq!(status.cooling_down, 3);
        assert_eq!(status.available, 2);
    }

    #[tokio::test]
    async fn no_keys_configured_is_exhausted_without_calling() {
        let pool = KeyPool::builder()
            .class(CredentialClass::anam(), Vec::<String>::new())
            .build()
            .unwrap();
        let mut calls = 0;

        let result: Result<(), RotationError<String>> = call_with_rotation(
            &pool,
            "anam",
            RetryPolicy::default(),
            &SubstringClassifier,
            |_key| {
                calls += 1;
                async { Ok(()) }
            },
        )
        .await;

        assert_eq!(calls, 0);
        match result {
            Err(RotationError::ExhaustedAllKeys { attempts, last, .. }) => {
                assert_eq!(attempts, 0);
                assert!(last.is_none());
            }
            other => panic!("expected ExhaustedAllKeys, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_attempt_policy_never_retries() {
        let pool = pool_with(&["a", "b"]);
        let mut calls = 0;

        let result: Result<(), _> = call_with_rotation(
            &pool,
            "google",
            RetryPolicy::new(0),
            &SubstringClassifier,
            |_key| {
                calls += 1;
                async { Err::<(), String>("429".to_string()) }
            },
        )
        .await;

        assert_eq!(calls, 1);
        assert!(result.unwrap_err().is_exhausted());
        // The failing key is still marked
        assert_eq!(pool.status_of("google").unwrap().cooling_down, 1);
    }

    #[tokio::test]
    async fn structured_classifier_can_replace_substrings() {
        #[derive(Debug)]
        struct StatusError(u16);

        let pool = pool_with(&["a", "b"]);
        let by_status = |err: &StatusError| provider::classify_status(err.0, "");

        let result = call_with_rotation(&pool, "google", RetryPolicy::default(), &by_status, |key| {
            async move {
                if key.expose() == "a" {
                    Err(StatusError(429))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(
            by_status(&StatusError(500)),
            ErrorClassification::Other
        );
    }

    #[test]
    fn exhausted_error_display_names_class() {
        let err: RotationError<String> = RotationError::ExhaustedAllKeys {
            class: "elevenlabs".into(),
            attempts: 3,
            last: None,
        };
        assert_eq!(
            err.to_string(),
            "all 'elevenlabs' keys exhausted after 3 attempt(s)"
        );
    }
}
