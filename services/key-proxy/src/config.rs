//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are never stored in the TOML. Each upstream names the environment
//! variable family its keys are read from (`GOOGLE_API_KEY`,
//! `GOOGLE_API_KEY_1`, ...), resolved once at startup.

use axum::http::HeaderName;
use key_pool::{CredentialClass, KeyPool, load_keys};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Path segments served by the proxy itself; a class may not shadow them.
const RESERVED_CLASSES: &[&str] = &["health", "metrics", "keys"];

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Calls per request including the first, across key rotations
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Key pool settings
#[derive(Debug, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            status_interval_secs: default_status_interval(),
        }
    }
}

/// One credentialed provider reachable under `/{class}/...`
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub class: String,
    pub upstream_url: String,
    /// Header carrying the key, e.g. `x-goog-api-key` or `authorization`
    pub key_header: String,
    /// Base env var name; defaults to `<CLASS>_API_KEY`
    #[serde(default)]
    pub key_env: Option<String>,
    /// Prepended to the key in the header value, e.g. `"Bearer "`
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl UpstreamConfig {
    /// Base environment variable name for this upstream's keys.
    pub fn env_base(&self) -> String {
        match &self.key_env {
            Some(name) => name.clone(),
            None => match CredentialClass::new(&self.class) {
                Ok(class) => class.env_base(),
                Err(_) => format!("{}_API_KEY", self.class.to_ascii_uppercase()),
            },
        }
    }

    pub fn header_name(&self) -> common::Result<HeaderName> {
        HeaderName::from_str(&self.key_header).map_err(|e| {
            common::Error::Config(format!(
                "invalid key_header {:?} for class {}: {e}",
                self.key_header, self.class
            ))
        })
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_attempts() -> u32 {
    key_pool::DEFAULT_MAX_ATTEMPTS
}

fn default_cooldown() -> u64 {
    key_pool::DEFAULT_COOLDOWN.as_secs()
}

fn default_status_interval() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    ///
    /// Class names are normalized to lowercase.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.proxy.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if config.keys.status_interval_secs == 0 {
            return Err(common::Error::Config(
                "status_interval_secs must be greater than 0".into(),
            ));
        }

        if config.upstreams.is_empty() {
            return Err(common::Error::Config(
                "at least one [[upstreams]] entry is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for upstream in &mut config.upstreams {
            let class = CredentialClass::new(&upstream.class)
                .map_err(|e| common::Error::Config(e.to_string()))?;
            if RESERVED_CLASSES.contains(&class.as_str()) {
                return Err(common::Error::Config(format!(
                    "class name {class} is reserved"
                )));
            }
            if !seen.insert(class.clone()) {
                return Err(common::Error::Config(format!(
                    "class {class} configured more than once"
                )));
            }
            upstream.class = class.to_string();

            if !upstream.upstream_url.starts_with("http://")
                && !upstream.upstream_url.starts_with("https://")
            {
                return Err(common::Error::Config(format!(
                    "upstream_url must start with http:// or https://, got: {}",
                    upstream.upstream_url
                )));
            }

            upstream.header_name()?;
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("amble-key-proxy.toml")
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.keys.cooldown_secs)
    }

    /// Build the key pool from the process environment.
    pub fn build_pool(&self) -> common::Result<KeyPool> {
        self.build_pool_with(|name| std::env::var(name).ok())
    }

    /// Build the key pool resolving variables through `lookup`.
    ///
    /// Every upstream must end up with at least one key.
    pub fn build_pool_with<F>(&self, lookup: F) -> common::Result<KeyPool>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = KeyPool::builder().cooldown(self.cooldown());
        for upstream in &self.upstreams {
            let env = upstream.env_base();
            let keys = load_keys(&env, &lookup);
            if keys.is_empty() {
                return Err(common::Error::NoKeys {
                    class: upstream.class.clone(),
                    env,
                });
            }
            let class = CredentialClass::new(&upstream.class)
                .map_err(|e| common::Error::Config(e.to_string()))?;
            builder = builder.class(class, keys);
        }
        builder
            .build()
            .map_err(|e| common::Error::Config(e.to_string()))
    }
}
