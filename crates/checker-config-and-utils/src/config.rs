//! Configuration management for the prime checker services.

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default outbox poll period.
pub const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 5_000;

/// Lower bound on the outbox poll period. Anything shorter is a busy loop.
pub const MIN_PUBLISH_INTERVAL_MS: u64 = 100;

/// Upper bound on the outbox poll period.
pub const MAX_PUBLISH_INTERVAL_MS: u64 = 300_000;

/// Main service configuration.
///
/// Every field has a default, so a config file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// SQLite database file holding `prime_checks` and `outbox`.
    pub database_path: PathBuf,
    /// Redis connection URL for the stream broker.
    pub redis_url: String,
    /// Outbox publisher tick period in milliseconds.
    pub publish_interval_ms: u64,
    /// Maximum messages fetched per pull.
    pub pull_batch_size: usize,
    /// How long a pull blocks waiting for messages.
    pub pull_wait_ms: u64,
    /// First redelivery delay after a nak.
    pub redelivery_backoff_base_ms: u64,
    /// Cap on the redelivery delay.
    pub redelivery_backoff_max_ms: u64,
    /// Deliveries after which a message is acked as poison.
    pub max_deliveries: u32,
    /// How long published messages stay in the stream.
    pub retention_hours: u64,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_from: String,
    /// Recipient for result emails when no per-user address is known.
    pub default_recipient: String,
    /// OTLP/HTTP traces endpoint. Unset disables span export.
    pub otlp_endpoint: Option<String>,
    /// Logical deployment environment.
    pub environment: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            database_path: PathBuf::from("prime_checker.db"),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            publish_interval_ms: DEFAULT_PUBLISH_INTERVAL_MS,
            pull_batch_size: 1,
            pull_wait_ms: 1_000,
            redelivery_backoff_base_ms: 1_000,
            redelivery_backoff_max_ms: 60_000,
            max_deliveries: 10,
            retention_hours: 24,
            smtp_host: "localhost".to_string(),
            smtp_port: 1025,
            smtp_from: "noreply@primechecker.local".to_string(),
            default_recipient: "user@example.com".to_string(),
            otlp_endpoint: None,
            environment: "development".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Override configuration from process environment variables.
    pub fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override fields from a key lookup. Unparseable numbers are ignored
    /// with a warning so a typo never silently zeroes a setting.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("PRIME_CHECKER_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = get("PRIME_CHECKER_DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = get("REDIS_URL") {
            self.redis_url = value;
        }
        if let Some(value) = get("PRIME_CHECKER_PUBLISH_INTERVAL_MS") {
            parse_into("PRIME_CHECKER_PUBLISH_INTERVAL_MS", &value, &mut self.publish_interval_ms);
        }
        if let Some(value) = get("SMTP_HOST") {
            self.smtp_host = value;
        }
        if let Some(value) = get("SMTP_PORT") {
            parse_into("SMTP_PORT", &value, &mut self.smtp_port);
        }
        if let Some(value) = get("SMTP_FROM") {
            self.smtp_from = value;
        }
        if let Some(value) = get("PRIME_CHECKER_DEFAULT_RECIPIENT") {
            self.default_recipient = value;
        }
        if let Some(value) = get("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.otlp_endpoint = Some(value);
        }
        if let Some(value) = get("PRIME_CHECKER_ENVIRONMENT") {
            self.environment = value;
        }
    }

    /// Reject settings that would make a loop spin or never deliver.
    pub fn validate(&self) -> CoreResult<()> {
        if !(MIN_PUBLISH_INTERVAL_MS..=MAX_PUBLISH_INTERVAL_MS).contains(&self.publish_interval_ms) {
            return Err(CoreError::Config(format!(
                "publish_interval_ms must be between {} and {}, got {}",
                MIN_PUBLISH_INTERVAL_MS, MAX_PUBLISH_INTERVAL_MS, self.publish_interval_ms
            )));
        }
        if self.pull_batch_size == 0 {
            return Err(CoreError::Config("pull_batch_size must be at least 1".to_string()));
        }
        if self.max_deliveries == 0 {
            return Err(CoreError::Config("max_deliveries must be at least 1".to_string()));
        }
        if self.redelivery_backoff_base_ms > self.redelivery_backoff_max_ms {
            return Err(CoreError::Config(format!(
                "redelivery_backoff_base_ms ({}) exceeds redelivery_backoff_max_ms ({})",
                self.redelivery_backoff_base_ms, self.redelivery_backoff_max_ms
            )));
        }
        if self.retention_hours == 0 {
            return Err(CoreError::Config("retention_hours must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn pull_wait(&self) -> Duration {
        Duration::from_millis(self.pull_wait_ms)
    }

    pub fn redelivery_backoff_base(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_base_ms)
    }

    pub fn redelivery_backoff_max(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_max_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3_600)
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(key, value, "Ignoring unparseable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.publish_interval(), Duration::from_secs(5));
        assert_eq!(config.retention(), Duration::from_secs(24 * 3_600));
        assert_eq!(config.default_recipient, "user@example.com");
        assert!(config.otlp_endpoint.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "publish_interval_ms": 250,
            "smtp_port": 2525
        }"#;

        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.publish_interval_ms, 250);
        assert_eq!(config.smtp_port, 2525);
        // Unspecified keys keep their defaults
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_config_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("missing.json")));
        assert!(matches!(result, Err(CoreError::Io(_))));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config {
            redis_url: "redis://from-file:6379".to_string(),
            ..Config::default()
        };

        config.apply_overrides(lookup(&[
            ("REDIS_URL", "redis://from-env:6380"),
            ("SMTP_PORT", "587"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318/v1/traces"),
            ("PRIME_CHECKER_DATABASE_PATH", "/tmp/checks.db"),
        ]));

        assert_eq!(config.redis_url, "redis://from-env:6380");
        assert_eq!(config.smtp_port, 587);
        assert_eq!(
            config.otlp_endpoint.as_deref(),
            Some("http://collector:4318/v1/traces")
        );
        assert_eq!(config.database_path, PathBuf::from("/tmp/checks.db"));
    }

    #[test]
    fn test_unparseable_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("SMTP_PORT", "not-a-port"),
            ("PRIME_CHECKER_PUBLISH_INTERVAL_MS", ""),
        ]));
        assert_eq!(config.smtp_port, 1025);
        assert_eq!(config.publish_interval_ms, DEFAULT_PUBLISH_INTERVAL_MS);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let config = Config {
            publish_interval_ms: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_oversized_interval_is_rejected() {
        let config = Config {
            publish_interval_ms: MAX_PUBLISH_INTERVAL_MS + 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_backoff_is_rejected() {
        let config = Config {
            redelivery_backoff_base_ms: 10_000,
            redelivery_backoff_max_ms: 1_000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let config = Config {
            pull_batch_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
