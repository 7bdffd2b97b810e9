//! Configuration loading and representation.

use thiserror::Error;
use tracing::warn;

use cms_events::JobPubSub;

/// Number of recent states replayed to late subscribers by default.
pub const DEFAULT_CACHE_SIZE: usize = 5;

pub const ENV_CACHE_SIZE: &str = "CMS_JOB_PUBSUB_CACHE_SIZE";
pub const ENV_RUNNER_NAME: &str = "CMS_JOB_RUNNER_NAME";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Job subsystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    /// Per-job replay cache depth. `0` disables caching and `has_publisher`.
    pub pubsub_cache_size: usize,
    /// Name for logging
    pub runner_name: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            pubsub_cache_size: DEFAULT_CACHE_SIZE,
            runner_name: "job-runner".to_string(),
        }
    }
}

impl JobsConfig {
    /// Load from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    ///
    /// The cache size is read as a signed integer; values `<= 0` collapse to `0`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_CACHE_SIZE) {
            let parsed: i64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    key: ENV_CACHE_SIZE,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
            if parsed < 0 {
                warn!(key = ENV_CACHE_SIZE, value = parsed, "negative cache size, caching disabled");
            }
            config.pubsub_cache_size = usize::try_from(parsed.max(0)).unwrap_or(usize::MAX);
        }

        if let Some(name) = lookup(ENV_RUNNER_NAME) {
            let name = name.trim();
            if !name.is_empty() {
                config.runner_name = name.to_string();
            }
        }

        Ok(config)
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.pubsub_cache_size = size;
        self
    }

    pub fn with_runner_name(mut self, name: impl Into<String>) -> Self {
        self.runner_name = name.into();
        self
    }

    pub fn build_pubsub(&self) -> JobPubSub {
        JobPubSub::new(self.pubsub_cache_size)
    }
}
