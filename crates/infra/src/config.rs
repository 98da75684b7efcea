//! Runtime configuration.
//!
//! Loaded in layers:
//! 1. Defaults in code
//! 2. Optional `config/larder.toml`
//! 3. Environment variables with the `LARDER__` prefix
//!    (e.g. `LARDER__RUNTIME__IDLE_TIMEOUT_MS=500`)

use std::time::Duration;

use config::{ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LarderConfig {
    /// Entity actor runtime settings
    pub runtime: RuntimeConfig,

    /// Cross-actor retry settings used by the transfer coordinator
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Bounded mailbox size per live actor
    pub mailbox_capacity: usize,

    /// An actor with no message for this long is evicted
    pub idle_timeout_ms: u64,

    /// Upper bound on delivering a request and waiting for its reply
    pub call_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per cross-actor call, first attempt included
    pub max_attempts: u32,

    /// Backoff before retry `n` is `n * retry_backoff_ms`
    pub backoff_ms: u64,
}

impl RuntimeConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl RetryConfig {
    /// Delay before the given retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(retry)))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            idle_timeout_ms: 300_000,
            call_timeout_ms: 5_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 50,
        }
    }
}

impl Default for LarderConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl LarderConfig {
    /// Load configuration from `config/larder.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/larder")
    }

    /// Same as [`LarderConfig::load`] with an explicit file stem.
    pub fn load_from(file: &str) -> Result<Self, ConfigError> {
        let runtime = RuntimeConfig::default();
        let retry = RetryConfig::default();

        let config = config::Config::builder()
            // Start with default values
            .set_default("runtime.mailbox_capacity", runtime.mailbox_capacity as u64)?
            .set_default("runtime.idle_timeout_ms", runtime.idle_timeout_ms)?
            .set_default("runtime.call_timeout_ms", runtime.call_timeout_ms)?
            .set_default("retry.max_attempts", u64::from(retry.max_attempts))?
            .set_default("retry.backoff_ms", retry.backoff_ms)?
            .add_source(File::with_name(file).required(false))
            // Override with environment variables (LARDER__ prefix)
            .add_source(
                Environment::with_prefix("LARDER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.mailbox_capacity == 0 {
            return Err(ConfigError::Message(
                "runtime.mailbox_capacity must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Message(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = LarderConfig::load_from("does/not/exist").unwrap();
        assert_eq!(loaded, LarderConfig::default());
        assert_eq!(loaded.runtime.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_grows_linearly() {
        let retry = RetryConfig {
            max_attempts: 4,
            backoff_ms: 20,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(60));
    }

    #[test]
    fn zero_mailbox_is_rejected() {
        let mut cfg = LarderConfig::default();
        cfg.runtime.mailbox_capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
