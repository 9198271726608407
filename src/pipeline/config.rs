//! Pipeline configuration from environment variables

use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse an optional numeric variable, falling back to `default` when unset
pub(crate) fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={:?}", key, raw))),
        _ => Ok(default),
    }
}

/// Configuration for the polling pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Portal origin, e.g. https://www.orangecarrier.com
    pub source_base_url: String,

    /// Optional newline-separated query key list replacing the built-in countries
    pub query_keys_file: Option<String>,

    /// Query keys fetched concurrently per batch
    pub batch_size: usize,

    /// Per-request transport timeout
    pub request_timeout_ms: u64,

    /// Extra time on top of the request timeout before a fetch is abandoned
    pub deadline_grace_ms: u64,

    /// Pause between batches
    pub batch_delay_ms: u64,

    /// Rows older than this are dropped before normalization
    pub staleness_cutoff_secs: i64,

    /// Trailing window kept by the retention sweeper
    pub retention_horizon_ms: i64,

    /// Retention sweeper period
    pub sweep_interval_ms: u64,

    /// Consecutive empty polls before a key is blacklisted
    pub blacklist_threshold: u32,

    /// Status line period
    pub status_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "data/rangewatch.db".to_string(),
            source_base_url: "https://www.orangecarrier.com".to_string(),
            query_keys_file: None,
            batch_size: 50,
            request_timeout_ms: 15_000,
            deadline_grace_ms: 5_000,
            batch_delay_ms: 500,
            staleness_cutoff_secs: 300,
            retention_horizon_ms: 300_000,
            sweep_interval_ms: 60_000,
            blacklist_threshold: 10,
            status_interval_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `RANGEWATCH_DB_PATH` (default: data/rangewatch.db)
    /// - `SOURCE_BASE_URL` (default: https://www.orangecarrier.com)
    /// - `QUERY_KEYS_FILE` (default: built-in country list)
    /// - `FETCH_BATCH_SIZE` (default: 50)
    /// - `REQUEST_TIMEOUT_MS` (default: 15000)
    /// - `FETCH_DEADLINE_GRACE_MS` (default: 5000)
    /// - `BATCH_DELAY_MS` (default: 500)
    /// - `STALENESS_CUTOFF_SECS` (default: 300)
    /// - `RETENTION_HORIZON_MS` (default: 300000)
    /// - `SWEEP_INTERVAL_MS` (default: 60000)
    /// - `BLACKLIST_THRESHOLD` (default: 10)
    /// - `STATUS_INTERVAL_MS` (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            db_path: lookup("RANGEWATCH_DB_PATH").unwrap_or(defaults.db_path),
            source_base_url: lookup("SOURCE_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.source_base_url),
            query_keys_file: lookup("QUERY_KEYS_FILE").filter(|p| !p.trim().is_empty()),
            batch_size: parse_or(&lookup, "FETCH_BATCH_SIZE", defaults.batch_size)?,
            request_timeout_ms: parse_or(&lookup, "REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
            deadline_grace_ms: parse_or(&lookup, "FETCH_DEADLINE_GRACE_MS", defaults.deadline_grace_ms)?,
            batch_delay_ms: parse_or(&lookup, "BATCH_DELAY_MS", defaults.batch_delay_ms)?,
            staleness_cutoff_secs: parse_or(&lookup, "STALENESS_CUTOFF_SECS", defaults.staleness_cutoff_secs)?,
            retention_horizon_ms: parse_or(&lookup, "RETENTION_HORIZON_MS", defaults.retention_horizon_ms)?,
            sweep_interval_ms: parse_or(&lookup, "SWEEP_INTERVAL_MS", defaults.sweep_interval_ms)?,
            blacklist_threshold: parse_or(&lookup, "BLACKLIST_THRESHOLD", defaults.blacklist_threshold)?,
            status_interval_ms: parse_or(&lookup, "STATUS_INTERVAL_MS", defaults.status_interval_ms)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue("FETCH_BATCH_SIZE must be > 0".to_string()));
        }
        if self.blacklist_threshold == 0 {
            return Err(ConfigError::InvalidValue("BLACKLIST_THRESHOLD must be > 0".to_string()));
        }
        if self.retention_horizon_ms <= 0 {
            return Err(ConfigError::InvalidValue("RETENTION_HORIZON_MS must be > 0".to_string()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("SWEEP_INTERVAL_MS must be > 0".to_string()));
        }
        if self.status_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("STATUS_INTERVAL_MS must be > 0".to_string()));
        }
        if !self.source_base_url.starts_with("http://") && !self.source_base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "SOURCE_BASE_URL must start with http:// or https://".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Hard outer deadline for one fetch: request timeout + grace
    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms + self.deadline_grace_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.db_path, "data/rangewatch.db");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.request_timeout_ms, 15_000);
        assert_eq!(config.fetch_deadline(), Duration::from_secs(20));
        assert_eq!(config.batch_delay_ms, 500);
        assert_eq!(config.staleness_cutoff_secs, 300);
        assert_eq!(config.retention_horizon_ms, 300_000);
        assert_eq!(config.sweep_interval_ms, 60_000);
        assert_eq!(config.blacklist_threshold, 10);
        assert!(config.query_keys_file.is_none());
    }

    #[test]
    fn test_custom_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("RANGEWATCH_DB_PATH", "/tmp/test.db"),
            ("SOURCE_BASE_URL", "http://localhost:8080/"),
            ("FETCH_BATCH_SIZE", "25"),
            ("BATCH_DELAY_MS", "250"),
            ("QUERY_KEYS_FILE", "keys.txt"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.source_base_url, "http://localhost:8080");
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.batch_delay(), Duration::from_millis(250));
        assert_eq!(config.query_keys_file.as_deref(), Some("keys.txt"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("FETCH_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));

        let err = PipelineConfig::from_lookup(lookup_from(&[("FETCH_BATCH_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("FETCH_BATCH_SIZE"));

        let err = PipelineConfig::from_lookup(lookup_from(&[("SOURCE_BASE_URL", "ftp://x")])).unwrap_err();
        assert!(err.to_string().contains("SOURCE_BASE_URL"));
    }

    #[test]
    fn test_zero_periods_rejected() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("SWEEP_INTERVAL_MS", "0")])).unwrap_err();
        assert!(err.to_string().contains("SWEEP_INTERVAL_MS"));

        let err = PipelineConfig::from_lookup(lookup_from(&[("STATUS_INTERVAL_MS", "0")])).unwrap_err();
        assert!(err.to_string().contains("STATUS_INTERVAL_MS"));

        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("SWEEP_INTERVAL_MS", "1"),
            ("STATUS_INTERVAL_MS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.sweep_interval_ms, 1);
    }
}
