//! Engine configuration
//!
//! Environment variables:
//! - VIGIL_RULES_FILE: JSON array of alert rules (binary only)
//! - VIGIL_RULE_REFRESH_SECS: Rule snapshot refresh interval (default: 30)
//! - VIGIL_SINK_TIMEOUT_MS: Bound on a single alert sink call (default: 5000)
//! - VIGIL_RETRY_MAX_ATTEMPTS: Delivery attempts before dead-lettering (default: 8)
//! - VIGIL_RETRY_BASE_MS: First retry delay (default: 500)
//! - VIGIL_RETRY_MAX_BACKOFF_MS: Retry delay cap (default: 60000)
//! - VIGIL_RETRY_TICK_MS: How often the retry worker scans backlogs (default: 250)
//! - VIGIL_WORKERS: Sample dispatch workers (default: number of CPUs)
//! - VIGIL_MAX_STALENESS_SECS: Rule snapshot age reported as stale (default: 300)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerts::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub rules_file: Option<PathBuf>,
    pub rule_refresh_secs: u64,
    pub sink_timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_tick_ms: u64,
    pub workers: usize,
    pub max_staleness_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rules_file: None,
            rule_refresh_secs: 30,
            sink_timeout_ms: 5000,
            retry_max_attempts: 8,
            retry_base_ms: 500,
            retry_max_backoff_ms: 60_000,
            retry_tick_ms: 250,
            workers: num_cpus::get(),
            max_staleness_secs: 300,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `VIGIL_*` variables that are set
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            rules_file: std::env::var("VIGIL_RULES_FILE")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            rule_refresh_secs: env_or("VIGIL_RULE_REFRESH_SECS", defaults.rule_refresh_secs),
            sink_timeout_ms: env_or("VIGIL_SINK_TIMEOUT_MS", defaults.sink_timeout_ms),
            retry_max_attempts: env_or("VIGIL_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            retry_base_ms: env_or("VIGIL_RETRY_BASE_MS", defaults.retry_base_ms),
            retry_max_backoff_ms: env_or(
                "VIGIL_RETRY_MAX_BACKOFF_MS",
                defaults.retry_max_backoff_ms,
            ),
            retry_tick_ms: env_or("VIGIL_RETRY_TICK_MS", defaults.retry_tick_ms),
            workers: env_or("VIGIL_WORKERS", defaults.workers),
            max_staleness_secs: env_or("VIGIL_MAX_STALENESS_SECS", defaults.max_staleness_secs),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |name: &'static str, value: u64| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    name,
                    reason: "must be greater than zero".to_string(),
                })
            } else {
                Ok(())
            }
        };

        zero("rule_refresh_secs", self.rule_refresh_secs)?;
        zero("sink_timeout_ms", self.sink_timeout_ms)?;
        zero("retry_max_attempts", self.retry_max_attempts as u64)?;
        zero("retry_tick_ms", self.retry_tick_ms)?;
        zero("workers", self.workers as u64)?;

        if self.retry_max_backoff_ms < self.retry_base_ms {
            return Err(ConfigError::Invalid {
                name: "retry_max_backoff_ms",
                reason: format!(
                    "{} is below retry_base_ms {}",
                    self.retry_max_backoff_ms, self.retry_base_ms
                ),
            });
        }
        Ok(())
    }

    pub fn rule_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.rule_refresh_secs)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn retry_tick(&self) -> Duration {
        Duration::from_millis(self.retry_tick_ms)
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_secs(self.max_staleness_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => parse_or(name, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(name: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(variable = name, value = raw, "Ignoring unparseable setting");
            default
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
