use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::Config;

/// Environment variable naming the config file.
pub const ENV_CONFIG: &str = "ORCH_CONFIG";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "ORCH_LOG_LEVEL";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_agents: {0}. Must be between 1 and 100")]
    InvalidMaxAgents(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Data directory cannot be empty")]
    EmptyDataDir,

    #[error("Invalid violation threshold: {0}. Cannot be 0")]
    InvalidViolationThreshold(u32),

    #[error("Invalid soft deadline fraction: {0}. Must be in (0, 1]")]
    InvalidSoftDeadline(f64),

    #[error("Invalid snapshot retention: {0}. Must keep at least 1")]
    InvalidRetention(usize),

    #[error("Pool {0} has negative capacity")]
    NegativePool(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. YAML file at `ORCH_CONFIG` (default `panion.yaml`, optional)
    /// 3. Environment variables (`ORCH_` prefix, `__` section separator)
    ///
    /// `ORCH_LOG_LEVEL` is honored as a flat alias for `logging.level`.
    pub fn load() -> Result<Config> {
        let file = std::env::var(ENV_CONFIG).unwrap_or_else(|_| "panion.yaml".to_string());
        Self::load_with_file(&file)
    }

    /// Load with an explicit config file path.
    pub fn load_with_file(path: impl AsRef<Path>) -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("ORCH_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        // Flat alias for the nested logging level.
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            config.logging.level = level;
        }

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.agents.max_agents == 0 || config.agents.max_agents > 100 {
            return Err(ConfigError::InvalidMaxAgents(config.agents.max_agents));
        }

        if config.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDataDir);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.monitor.violation_threshold == 0 {
            return Err(ConfigError::InvalidViolationThreshold(
                config.monitor.violation_threshold,
            ));
        }

        let soft = config.sandbox.soft_deadline_fraction;
        if !(soft > 0.0 && soft <= 1.0) {
            return Err(ConfigError::InvalidSoftDeadline(soft));
        }

        if config.snapshot.retain == 0 {
            return Err(ConfigError::InvalidRetention(config.snapshot.retain));
        }

        for (name, capacity) in &config.pools {
            if *capacity < 0.0 {
                return Err(ConfigError::NegativePool(name.clone()));
            }
        }

        if config.synthesis.worker_pool == 0 {
            return Err(ConfigError::ValidationFailed(
                "synthesis.worker_pool cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        assert!(ConfigLoader::validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.agents.max_agents = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxAgents(0))
        ));

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));

        let mut config = Config::default();
        config.sandbox.soft_deadline_fraction = 1.5;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidSoftDeadline(_))
        ));

        let mut config = Config::default();
        config.snapshot.retain = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidRetention(0))
        ));
    }

    #[test]
    fn test_file_and_env_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port: 9001\nlogging:\n  level: debug").unwrap();
        let path = file.path().to_path_buf();

        temp_env::with_vars(
            [
                ("ORCH_PORT", Some("9002")),
                ("ORCH_LOG_LEVEL", Some("warn")),
            ],
            || {
                let config = ConfigLoader::load_with_file(&path).unwrap();
                // Env beats file, flat alias beats nested file value.
                assert_eq!(config.port, 9002);
                assert_eq!(config.logging.level, "warn");
            },
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        temp_env::with_vars([("ORCH_PORT", None::<&str>), ("ORCH_LOG_LEVEL", None)], || {
            let config = ConfigLoader::load_with_file("does-not-exist.yaml").unwrap();
            assert_eq!(config.port, 8000);
        });
    }
}
