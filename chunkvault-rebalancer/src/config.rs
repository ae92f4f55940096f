//! Rebalancer configuration
//!
//! Layered, lowest precedence first: built-in defaults, an optional TOML
//! file, `CHUNKVAULT_*` environment variables, then command-line flags
//! (applied by the binary).

use chunkvault_core::{DEFAULT_MIN_REPLICAS, DEFAULT_NAMESPACE};
use chunkvault_metadata::HealthConfig;
use chunkvault_storage::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Rebalancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalancerConfig {
    /// Floor on online replicas per chunk
    pub min_replicas: usize,

    /// Run the load rebalancer after repair
    pub balance_load: bool,

    /// Compute and report, but do not mutate
    pub dry_run: bool,

    /// A node above `overload_factor * avg` load is drained
    pub overload_factor: f64,

    /// A node below `underload_factor * avg` load is filled
    pub underload_factor: f64,

    /// Bucket holding chunk blobs on every node
    pub namespace: String,

    /// Bound on every node transport call, in seconds
    pub transport_timeout_secs: u64,

    /// Fall back to deduplicated copies when no own replica verifies
    pub use_dedup_sources: bool,

    /// Never pick a target without room for the chunk
    pub respect_capacity: bool,

    /// Recompute node counters from replica links before each run
    pub refresh_metrics: bool,

    /// PostgreSQL database URL
    pub database_url: Option<String>,

    /// Seconds between runs; 0 runs once
    pub interval_secs: u64,

    /// Timeout for a liveness probe, in seconds
    pub health_timeout_secs: u64,

    /// Consecutive probe failures before a node is marked offline
    pub failure_threshold: u32,

    /// S3 transport settings
    pub transport: TransportConfig,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            min_replicas: DEFAULT_MIN_REPLICAS,
            balance_load: false,
            dry_run: false,
            overload_factor: 1.3,
            underload_factor: 0.8,
            namespace: DEFAULT_NAMESPACE.to_string(),
            transport_timeout_secs: 30,
            use_dedup_sources: true,
            respect_capacity: true,
            refresh_metrics: false,
            database_url: None,
            interval_secs: 0,
            health_timeout_secs: 5,
            failure_threshold: 1,
            transport: TransportConfig::default(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string(), value.to_string()))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(name.to_string(), value.to_string())),
    }
}

impl RebalancerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay values from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overlay values from an environment lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CHUNKVAULT_MIN_REPLICAS") {
            self.min_replicas = parse_env("CHUNKVAULT_MIN_REPLICAS", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_BALANCE_LOAD") {
            self.balance_load = parse_bool("CHUNKVAULT_BALANCE_LOAD", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_DRY_RUN") {
            self.dry_run = parse_bool("CHUNKVAULT_DRY_RUN", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_OVERLOAD_FACTOR") {
            self.overload_factor = parse_env("CHUNKVAULT_OVERLOAD_FACTOR", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_UNDERLOAD_FACTOR") {
            self.underload_factor = parse_env("CHUNKVAULT_UNDERLOAD_FACTOR", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = lookup("CHUNKVAULT_TRANSPORT_TIMEOUT_SECS") {
            self.transport_timeout_secs = parse_env("CHUNKVAULT_TRANSPORT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_USE_DEDUP_SOURCES") {
            self.use_dedup_sources = parse_bool("CHUNKVAULT_USE_DEDUP_SOURCES", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_RESPECT_CAPACITY") {
            self.respect_capacity = parse_bool("CHUNKVAULT_RESPECT_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_REFRESH_METRICS") {
            self.refresh_metrics = parse_bool("CHUNKVAULT_REFRESH_METRICS", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_INTERVAL_SECS") {
            self.interval_secs = parse_env("CHUNKVAULT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_HEALTH_TIMEOUT_SECS") {
            self.health_timeout_secs = parse_env("CHUNKVAULT_HEALTH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("CHUNKVAULT_FAILURE_THRESHOLD") {
            self.failure_threshold = parse_env("CHUNKVAULT_FAILURE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = lookup("CHUNKVAULT_S3_REGION") {
            self.transport.region = v;
        }
        if let Some(v) = lookup("CHUNKVAULT_S3_ACCESS_KEY") {
            self.transport.access_key = Some(v);
        }
        if let Some(v) = lookup("CHUNKVAULT_S3_SECRET_KEY") {
            self.transport.secret_key = Some(v);
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_replicas == 0 {
            return Err(ConfigError::ValidationError(
                "min_replicas must be at least 1".to_string(),
            ));
        }
        if !(self.overload_factor > 0.0) || !(self.underload_factor > 0.0) {
            return Err(ConfigError::ValidationError(
                "load factors must be positive".to_string(),
            ));
        }
        if self.underload_factor >= self.overload_factor {
            return Err(ConfigError::ValidationError(format!(
                "underload_factor ({}) must be below overload_factor ({})",
                self.underload_factor, self.overload_factor
            )));
        }
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "namespace must not be empty".to_string(),
            ));
        }
        if self.transport_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "transport_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Bound on every node transport call
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    /// Interval between runs, `None` for a single run
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    /// Settings for the liveness probe
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            check_timeout: Duration::from_secs(self.health_timeout_secs),
            failure_threshold: self.failure_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RebalancerConfig::default();
        assert_eq!(config.min_replicas, 2);
        assert!(!config.balance_load);
        assert!(!config.dry_run);
        assert_eq!(config.namespace, "file-chunks");
        assert_eq!(config.transport_timeout(), Duration::from_secs(30));
        assert!(config.interval().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
min_replicas = 3
balance_load = true
interval_secs = 600

[transport]
region = "eu-west-1"
"#
        )
        .unwrap();

        let config = RebalancerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.min_replicas, 3);
        assert!(config.balance_load);
        assert_eq!(config.interval(), Some(Duration::from_secs(600)));
        assert_eq!(config.transport.region, "eu-west-1");
        assert!(config.transport.force_path_style);
        assert_eq!(config.overload_factor, 1.3);
    }

    #[test]
    fn test_from_file_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "min_replicas = \"many\"").unwrap();
        let err = RebalancerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RebalancerConfig::default();
        config
            .apply_env_from(env(&[
                ("CHUNKVAULT_MIN_REPLICAS", "4"),
                ("CHUNKVAULT_DRY_RUN", "yes"),
                ("CHUNKVAULT_OVERLOAD_FACTOR", "1.5"),
                ("DATABASE_URL", "postgres://db/chunkvault"),
                ("CHUNKVAULT_S3_ACCESS_KEY", "minio"),
            ]))
            .unwrap();

        assert_eq!(config.min_replicas, 4);
        assert!(config.dry_run);
        assert_eq!(config.overload_factor, 1.5);
        assert_eq!(config.database_url.as_deref(), Some("postgres://db/chunkvault"));
        assert_eq!(config.transport.access_key.as_deref(), Some("minio"));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = RebalancerConfig::default();
        let err = config
            .apply_env_from(env(&[("CHUNKVAULT_BALANCE_LOAD", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "CHUNKVAULT_BALANCE_LOAD"));
    }

    #[test]
    fn test_validate() {
        let zero = RebalancerConfig {
            min_replicas: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let inverted = RebalancerConfig {
            overload_factor: 0.7,
            underload_factor: 0.8,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let negative = RebalancerConfig {
            underload_factor: -1.0,
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }
}
