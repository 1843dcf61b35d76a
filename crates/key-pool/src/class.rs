//! Credential class identifiers

use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// Name of a pool of interchangeable keys for one external provider.
///
/// Lowercase ASCII letters, digits, `-` and `_`. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CredentialClass(String);

impl CredentialClass {
    /// LLM provider (Gemini)
    pub const GOOGLE: &'static str = "google";
    /// Avatar video sessions
    pub const ANAM: &'static str = "anam";
    /// Text-to-speech
    pub const ELEVENLABS: &'static str = "elevenlabs";

    /// Parse a class name. Input is trimmed and lowercased.
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref().trim().to_ascii_lowercase();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(Error::InvalidClass(name));
        }
        Ok(Self(name))
    }

    pub fn google() -> Self {
        Self(Self::GOOGLE.to_string())
    }

    pub fn anam() -> Self {
        Self(Self::ANAM.to_string())
    }

    pub fn elevenlabs() -> Self {
        Self(Self::ELEVENLABS.to_string())
    }

    /// The classes the companion backend ships with.
    pub fn well_known() -> Vec<Self> {
        vec![Self::google(), Self::anam(), Self::elevenlabs()]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base environment variable name: `google` → `GOOGLE_API_KEY`.
    pub fn env_base(&self) -> String {
        format!("{}_API_KEY", self.0.to_ascii_uppercase().replace('-', "_"))
    }
}

impl fmt::Display for CredentialClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CredentialClass {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CredentialClass {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
