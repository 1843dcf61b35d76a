//! Error types for key pool construction

/// Errors from building a key pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid credential class name: {0:?}")]
    InvalidClass(String),

    #[error("credential class configured twice: {0}")]
    DuplicateClass(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
