//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::Limit;

/// Prefix of environment variables overriding file settings,
/// e.g. `TOLLGATE__LIMITER__BURST=20`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens added per second, or `unlimited`
    #[serde(default = "default_rate")]
    pub rate: RateSetting,

    /// Maximum tokens a bucket can hold
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// How often idle per-caller buckets are evicted, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            burst: default_burst(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl LimiterConfig {
    pub fn limit(&self) -> Limit {
        self.rate.into()
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if let RateSetting::PerSecond(rate) = self.rate {
            if rate.is_nan() || rate < 0.0 {
                return Err(TollgateError::Config(format!(
                    "limiter.rate must be a non-negative number or \"unlimited\", got {}",
                    rate
                )));
            }
        }
        if self.cleanup_interval_secs == 0 {
            return Err(TollgateError::Config(
                "limiter.cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A configured refill rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateSetting {
    /// Tokens per second
    PerSecond(f64),
    /// A named rate
    Named(NamedRate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamedRate {
    #[serde(alias = "inf", alias = "infinite")]
    Unlimited,
}

impl From<RateSetting> for Limit {
    fn from(rate: RateSetting) -> Self {
        match rate {
            RateSetting::PerSecond(rate) => Limit::per_second(rate),
            RateSetting::Named(NamedRate::Unlimited) => Limit::INF,
        }
    }
}

fn default_rate() -> RateSetting {
    RateSetting::PerSecond(10.0)
}

fn default_burst() -> u32 {
    20
}

fn default_cleanup_interval() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `TOLLGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.limiter.limit(), Limit::per_second(10.0));
        assert_eq!(config.limiter.burst, 20);
        assert_eq!(config.limiter.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_parse_limiter_config() {
        let yaml = r#"
limiter:
  rate: 2.5
  burst: 5
  cleanup_interval_secs: 30
logging:
  level: debug
  json: true
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.limit(), Limit::per_second(2.5));
        assert_eq!(config.limiter.burst, 5);
        assert_eq!(config.limiter.cleanup_interval_secs, 30);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_parse_integer_rate() {
        let config = TollgateConfig::from_yaml("limiter:\n  rate: 3\n").unwrap();
        assert_eq!(config.limiter.limit(), Limit::per_second(3.0));
        assert_eq!(config.limiter.burst, 20);
    }

    #[test]
    fn test_parse_unlimited_rate() {
        for name in ["unlimited", "inf", "infinite"] {
            let yaml = format!("limiter:\n  rate: {}\n", name);
            let config = TollgateConfig::from_yaml(&yaml).unwrap();
            assert!(config.limiter.limit().is_unlimited(), "{name}");
        }
    }

    #[test]
    fn test_rejects_invalid_settings() {
        assert!(TollgateConfig::from_yaml("limiter:\n  rate: -1\n").is_err());
        assert!(TollgateConfig::from_yaml("limiter:\n  rate: fast\n").is_err());
        assert!(TollgateConfig::from_yaml("limiter:\n  cleanup_interval_secs: 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiter:\n  rate: unlimited\n  burst: 3\n").unwrap();

        let config = TollgateConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert!(config.limiter.limit().is_unlimited());
        assert_eq!(config.limiter.burst, 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("tollgate-does-not-exist.yaml");
        let err = TollgateConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
    }
}
