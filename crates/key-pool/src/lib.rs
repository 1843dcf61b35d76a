//! Multi-key credential pool with quota-aware fallback
//!
//! Holds, per credential class (one class per external provider such as
//! `google`, `anam` or `elevenlabs`), an ordered list of interchangeable API
//! keys and hands them out round-robin. Keys that fail with a quota or
//! authentication error are marked exhausted and skipped until a cooldown
//! elapses. `call_with_rotation` wraps a single provider call in the bounded
//! retry loop that drives this.
//!
//! Key lifecycle:
//! 1. Startup loads `<CLASS>_API_KEY`, `<CLASS>_API_KEY_1`, ... from the environment
//! 2. `get_key` selects round-robin from the class cursor, skipping cooling keys
//! 3. Provider call fails with a quota/auth error → `mark_exhausted`
//! 4. Cooldown (1 hour by default) elapses → key is selectable again
//!
//! Exhaustion state lives in memory only and resets on restart.

pub mod class;
pub mod error;
pub mod load;
pub mod pool;
pub mod reporter;
pub mod retry;

pub use class::CredentialClass;
pub use error::{Error, Result};
pub use load::{load_keys, load_keys_from_env};
pub use pool::{ClassStatus, DEFAULT_COOLDOWN, KeyPool, KeyPoolBuilder};
pub use reporter::spawn_status_task;
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, DEGRADED_MESSAGE, RetryPolicy, RotationError, call_with_rotation,
};

/// A single API key. Redacted in Debug/Display.
pub type ApiKey = common::Secret<String>;
