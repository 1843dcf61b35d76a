//! Shared types for the Amble key rotation workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
