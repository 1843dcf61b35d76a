//! Key pool, round-robin selection and exhaustion tracking
//!
//! Each credential class keeps its keys, a rotation cursor and an exhaustion
//! map behind one mutex. Every operation here is in-memory and non-suspending,
//! so a blocking `std::sync::Mutex` is enough and concurrent requests can no
//! longer read the same cursor and pick the same "next" key.
//!
//! Exhaustion records are never swept. A record older than the cooldown is
//! inert: the key counts as available again without any explicit transition.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ApiKey;
use crate::class::CredentialClass;
use crate::error::{Error, Result};
use crate::load::{dedupe, load_keys_from_env};

/// How long an exhausted key is skipped before it becomes selectable again.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3600);

/// Per-class key counts for health reporting.
///
/// `available` includes keys whose cooldown has elapsed even though their
/// exhaustion record is still present; `available + cooling_down == total`.
/// `exhausted` is always 0: a failed key is reported under `cooling_down`
/// until it recovers. `ever_exhausted` counts keys marked at least once since
/// startup, whether still cooling or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassStatus {
    pub total: usize,
    pub available: usize,
    pub cooling_down: usize,
    pub exhausted: usize,
    pub ever_exhausted: usize,
}

impl ClassStatus {
    /// "healthy" when every key is available, "degraded" when some are,
    /// "unhealthy" when none are (or none are configured).
    pub fn label(&self) -> &'static str {
        if self.total > 0 && self.available == self.total {
            "healthy"
        } else if self.available > 0 {
            "degraded"
        } else {
            "unhealthy"
        }
    }
}

/// Keys, cursor and exhaustion records for one credential class.
struct ClassKeys {
    keys: Vec<ApiKey>,
    /// Always `< keys.len()`, or 0 when empty.
    cursor: usize,
    exhausted_at: HashMap<ApiKey, Instant>,
}

impl ClassKeys {
    fn new(keys: Vec<ApiKey>) -> Self {
        Self {
            keys,
            cursor: 0,
            exhausted_at: HashMap::new(),
        }
    }

    fn is_available(&self, key: &ApiKey, now: Instant, cooldown: Duration) -> bool {
        match self.exhausted_at.get(key) {
            None => true,
            Some(at) => now.saturating_duration_since(*at) > cooldown,
        }
    }

    fn status(&self, now: Instant, cooldown: Duration) -> ClassStatus {
        let mut status = ClassStatus {
            total: self.keys.len(),
            ..ClassStatus::default()
        };
        for key in &self.keys {
            if self.exhausted_at.contains_key(key) {
                status.ever_exhausted += 1;
            }
            if self.is_available(key, now, cooldown) {
                status.available += 1;
            } else {
                status.cooling_down += 1;
            }
        }
        status
    }
}

/// Credential manager: round-robin key selection with cooldown-based fallback.
///
/// Constructed once at startup and shared via `Arc`. The set of classes and
/// their keys is fixed after construction; only cursors and exhaustion records
/// change.
pub struct KeyPool {
    classes: HashMap<CredentialClass, Mutex<ClassKeys>>,
    cooldown: Duration,
}

impl KeyPool {
    pub fn builder() -> KeyPoolBuilder {
        KeyPoolBuilder::default()
    }

    /// Build a pool for `classes`, reading each class's keys from
    /// `<CLASS>_API_KEY` and `<CLASS>_API_KEY_<n>`.
    ///
    /// Classes with no keys are still registered; `get_key` returns `None` for them.
    pub fn from_env(classes: &[CredentialClass], cooldown: Duration) -> Result<Self> {
        let mut builder = KeyPool::builder().cooldown(cooldown);
        for class in classes {
            builder = builder.class(class.clone(), load_keys_from_env(&class.env_base()));
        }
        builder.build()
    }

    /// Select the next available key for `class`.
    ///
    /// Scans every slot once starting at the class cursor, skipping keys still
    /// in cooldown. On a hit the cursor moves just past the returned key. Returns
    /// `None` for unknown classes, empty classes and fully exhausted classes; the
    /// cursor is left untouched in those cases.
    pub fn get_key(&self, class: &str) -> Option<ApiKey> {
        let Some(entry) = self.classes.get(class) else {
            error!(class, "unknown credential class");
            metrics::counter!("key_pool_unavailable_total", "class" => class.to_string())
                .increment(1);
            return None;
        };

        let mut state = lock(entry);
        let n = state.keys.len();
        if n == 0 {
            error!(class, "no keys configured");
            metrics::counter!("key_pool_unavailable_total", "class" => class.to_string())
                .increment(1);
            return None;
        }

        let now = Instant::now();
        let start = state.cursor;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if state.is_available(&state.keys[idx], now, self.cooldown) {
                state.cursor = (idx + 1) % n;
                info!(class, key = idx + 1, total = n, "using key");
                metrics::counter!("key_pool_selections_total", "class" => class.to_string())
                    .increment(1);
                return Some(state.keys[idx].clone());
            }
        }

        error!(class, total = n, "all keys exhausted");
        metrics::counter!("key_pool_unavailable_total", "class" => class.to_string())
            .increment(1);
        None
    }

    /// Record that `key` just failed with a quota or auth error.
    ///
    /// Always (re)writes the record to now, so marking an already exhausted key
    /// restarts its cooldown. Keys outside the pool may be marked; they are
    /// never selected either way. Unknown classes are ignored.
    pub fn mark_exhausted(&self, class: &str, key: &ApiKey, reason: &str) {
        let Some(entry) = self.classes.get(class) else {
            debug!(class, reason, "ignoring exhaustion for unknown credential class");
            return;
        };

        let now = Instant::now();
        let mut state = lock(entry);
        state.exhausted_at.insert(key.clone(), now);
        let status = state.status(now, self.cooldown);
        drop(state);

        warn!(
            class,
            key = %key.masked(),
            reason,
            cooldown_secs = self.cooldown.as_secs(),
            "key marked exhausted"
        );
        info!(
            class,
            available = status.available,
            total = status.total,
            "keys still available"
        );
        metrics::counter!(
            "key_pool_exhausted_total",
            "class" => class.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Whether `key` would currently be eligible for selection in `class`.
    pub fn is_available(&self, class: &str, key: &ApiKey) -> bool {
        self.classes
            .get(class)
            .is_some_and(|entry| lock(entry).is_available(key, Instant::now(), self.cooldown))
    }

    /// Counts for one class, or `None` if the class is not configured.
    pub fn status_of(&self, class: &str) -> Option<ClassStatus> {
        let now = Instant::now();
        self.classes
            .get(class)
            .map(|entry| lock(entry).status(now, self.cooldown))
    }

    /// Counts for every configured class, ordered by class name.
    pub fn get_status(&self) -> BTreeMap<String, ClassStatus> {
        let now = Instant::now();
        self.classes
            .iter()
            .map(|(class, entry)| (class.to_string(), lock(entry).status(now, self.cooldown)))
            .collect()
    }

    /// Configured classes, ordered by name.
    pub fn classes(&self) -> Vec<CredentialClass> {
        let mut classes: Vec<CredentialClass> = self.classes.keys().cloned().collect();
        classes.sort();
        classes
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

/// Lock a class entry. A panic while holding the lock cannot leave the state
/// invalid (cursor writes are single assignments), so poisoning is ignored.
fn lock(entry: &Mutex<ClassKeys>) -> MutexGuard<'_, ClassKeys> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for `KeyPool`.
pub struct KeyPoolBuilder {
    cooldown: Duration,
    classes: Vec<(CredentialClass, Vec<ApiKey>)>,
}

impl Default for KeyPoolBuilder {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            classes: Vec::new(),
        }
    }
}

impl KeyPoolBuilder {
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Register a class with its keys in rotation order. Duplicates are dropped.
    pub fn class<I>(mut self, class: CredentialClass, keys: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ApiKey>,
    {
        self.classes.push((class, dedupe(keys)));
        self
    }

    pub fn build(self) -> Result<KeyPool> {
        let mut classes = HashMap::with_capacity(self.classes.len());
        for (class, keys) in self.classes {
            if classes.contains_key(&class) {
                return Err(Error::DuplicateClass(class.to_string()));
            }
            info!(class = %class, keys = keys.len(), "credential class loaded");
            classes.insert(class, Mutex::new(ClassKeys::new(keys)));
        }
        Ok(KeyPool {
            classes,
            cooldown: self.cooldown,
        })
    }
}
