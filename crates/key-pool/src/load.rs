//! Key discovery from the process environment
//!
//! For a base name `GOOGLE_API_KEY` the lookup order is:
//! 1. `GOOGLE_API_KEY` (single-key setups)
//! 2. `GOOGLE_API_KEY_1`, `GOOGLE_API_KEY_2`, ... until the first gap
//!
//! Values are taken verbatim and never trimmed; empty values are ignored, and
//! duplicates dropped keeping the first occurrence so the configured order is
//! the rotation order.

use std::collections::HashSet;

use tracing::debug;

use crate::ApiKey;

/// Load keys for `base` using `lookup` to resolve variable names.
///
/// `lookup` is injectable so callers can read from a config map or a test
/// fixture instead of the real environment.
pub fn load_keys<F>(base: &str, lookup: F) -> Vec<ApiKey>
where
    F: Fn(&str) -> Option<String>,
{
    let mut raw = Vec::new();

    if let Some(single) = non_empty(lookup(base)) {
        raw.push(single);
    }

    let mut i = 1usize;
    while let Some(value) = non_empty(lookup(&format!("{base}_{i}"))) {
        raw.push(value);
        i += 1;
    }

    let found = raw.len();
    let keys = dedupe(raw);
    debug!(base, found, unique = keys.len(), "loaded keys");
    keys
}

/// Load keys for `base` from the process environment.
pub fn load_keys_from_env(base: &str) -> Vec<ApiKey> {
    load_keys(base, |name| std::env::var(name).ok())
}

/// Drop repeated values, keeping first-seen order.
pub(crate) fn dedupe<I>(values: I) -> Vec<ApiKey>
where
    I: IntoIterator,
    I::Item: Into<ApiKey>,
{
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for value in values {
        let key: ApiKey = value.into();
        if seen.insert(key.clone()) {
            unique.push(key);
        }
    }
    unique
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
