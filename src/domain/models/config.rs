//! Runtime configuration tree.
//!
//! Loaded by the config loader from defaults, a YAML file, and `ORCH_*`
//! environment variables. Every section has serde defaults so partial
//! files stay valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP facade port (`ORCH_PORT`)
    pub port: u16,
    /// Root for snapshots, plugin store, goal history, logs (`ORCH_DATA_DIR`)
    pub data_dir: PathBuf,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub agents: AgentConfig,
    pub sandbox: SandboxConfig,
    pub synthesis: SynthesisConfig,
    pub snapshot: SnapshotConfig,
    /// Shared pool capacities by resource name
    pub pools: BTreeMap<String, f64>,
}

impl Default for Config {
    fn default() -> Self {
        let mut pools = BTreeMap::new();
        pools.insert("cpu_percent".to_string(), 400.0);
        pools.insert("memory_mb".to_string(), 4096.0);
        pools.insert("threads".to_string(), 64.0);
        pools.insert("connections".to_string(), 128.0);
        Self {
            port: 8000,
            data_dir: PathBuf::from(".panion"),
            logging: LoggingConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            agents: AgentConfig::default(),
            sandbox: SandboxConfig::default(),
            synthesis: SynthesisConfig::default(),
            snapshot: SnapshotConfig::default(),
            pools,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error (`ORCH_LOG_LEVEL`)
    pub level: String,
    /// json | pretty
    pub format: String,
    /// Also write rolling files under `<data_dir>/logs/`
    pub to_files: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            to_files: true,
        }
    }
}

/// Scheduler defaults applied to tasks without overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub default_timeout_secs: u64,
    pub default_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30 * 60,
            default_max_retries: 3,
        }
    }
}

/// Resource monitor cadence and quota enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling cadence in seconds
    pub interval_secs: u64,
    /// Violations within the window that raise a quota event
    pub violation_threshold: u32,
    /// Samples the violation window spans
    pub violation_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            violation_threshold: 3,
            violation_window: 3,
        }
    }
}

/// Agent fleet limits and recovery tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hard cap across all goals
    pub max_agents: usize,
    /// Heartbeat cadence for spawned workers, in seconds
    pub heartbeat_secs: u64,
    /// Heartbeats are stale beyond `factor x monitor interval`
    pub stale_after_factor: u32,
    /// Grace period for graceful stop before forced termination
    pub grace_period_secs: u64,
    /// Consecutive failures that disable a role
    pub role_failure_threshold: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_agents: 16,
            heartbeat_secs: 5,
            stale_after_factor: 2,
            grace_period_secs: 5,
            role_failure_threshold: 3,
        }
    }
}

/// Sandbox execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Fraction of the timeout at which cooperative cancel is signalled
    pub soft_deadline_fraction: f64,
    /// Container engine command to wrap the runner in (e.g. "docker");
    /// bare subprocess isolation when unset
    pub container_engine: Option<String>,
    /// Image used with the container engine
    pub container_image: String,
    /// Path to the plugin runner binary; resolved beside the current
    /// executable when unset
    pub plugin_runner: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            soft_deadline_fraction: 0.8,
            container_engine: None,
            container_image: "panion-plugin:latest".to_string(),
            plugin_runner: None,
        }
    }
}

/// Plugin synthesis pipeline bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub max_refinement_iterations: u32,
    /// Concurrent template fills
    pub worker_pool: usize,
    /// Synthesize declared capability gaps before scheduling (true) or
    /// lazily on first use (false)
    pub eager: bool,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_refinement_iterations: 3,
            worker_pool: 2,
            eager: false,
        }
    }
}

/// Checkpoint cadence and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub interval_secs: u64,
    /// Snapshots kept on disk
    pub retain: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            retain: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.monitor.interval_secs, 1);
        assert_eq!(config.monitor.violation_threshold, 3);
        assert_eq!(config.scheduler.default_max_retries, 3);
        assert_eq!(config.snapshot.retain, 2);
        assert!((config.sandbox.soft_deadline_fraction - 0.8).abs() < f64::EPSILON);
        assert!(config.pools.contains_key("memory_mb"));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("port: 9100\n").unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.agents.max_agents, 16);
    }
}
