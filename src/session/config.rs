//! Session configuration from environment variables

use super::retry::RetryPolicy;
use crate::pipeline::config::{parse_or, ConfigError};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub browserless_api_key: String,
    pub browserless_url: String,
    /// Dotenv file the token pair is persisted to
    pub credentials_path: String,
    pub refresh_interval_ms: u64,
    pub login_timeout_ms: u64,
    pub retry_initial_ms: u64,
    /// Retries after the first failed attempt in one cycle
    pub retry_max_retries: u32,
    pub cooldown_ms: u64,
}

impl SessionConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BROWSERLESS_API_KEY` (required)
    /// - `BROWSERLESS_URL` (default: https://production-sfo.browserless.io)
    /// - `CREDENTIALS_ENV_PATH` (default: .env)
    /// - `TOKEN_REFRESH_INTERVAL_MS` (default: 6600000)
    /// - `LOGIN_TIMEOUT_MS` (default: 120000)
    /// - `REFRESH_RETRY_INITIAL_MS` (default: 30000)
    /// - `REFRESH_RETRY_MAX_RETRIES` (default: 3, retries after the first attempt)
    /// - `REFRESH_COOLDOWN_MS` (default: 300000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let browserless_api_key = lookup("BROWSERLESS_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVariable("BROWSERLESS_API_KEY".to_string()))?;

        let config = Self {
            browserless_api_key,
            browserless_url: lookup("BROWSERLESS_URL")
                .unwrap_or_else(|| "https://production-sfo.browserless.io".to_string()),
            credentials_path: lookup("CREDENTIALS_ENV_PATH").unwrap_or_else(|| ".env".to_string()),
            refresh_interval_ms: parse_or(&lookup, "TOKEN_REFRESH_INTERVAL_MS", 6_600_000)?,
            login_timeout_ms: parse_or(&lookup, "LOGIN_TIMEOUT_MS", 120_000)?,
            retry_initial_ms: parse_or(&lookup, "REFRESH_RETRY_INITIAL_MS", 30_000)?,
            retry_max_retries: parse_or(&lookup, "REFRESH_RETRY_MAX_RETRIES", 3)?,
            cooldown_ms: parse_or(&lookup, "REFRESH_COOLDOWN_MS", 300_000)?,
        };

        if config.refresh_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "TOKEN_REFRESH_INTERVAL_MS must be > 0".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_initial_ms),
            self.retry_max_retries,
            Duration::from_millis(self.cooldown_ms),
        )
    }
}
