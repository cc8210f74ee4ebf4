//! Plugin catalog domain model: metadata, lifecycle, version constraints,
//! and rolling scores.

use chrono::{DateTime, Utc};
use semver::{Prerelease, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::resource::ResourceQuota;

/// Health threshold below which `resolve` skips a plugin.
pub const DEFAULT_HEALTH_THRESHOLD: f64 = 0.7;

/// Smoothing factor for the rolling score updates.
pub const SCORE_ALPHA: f64 = 0.2;

/// Deterministic plugin id for a `(name, version)` pair.
///
/// Registration is id-stable: unregistering and re-registering the same
/// pair yields the same id.
pub fn plugin_id(name: &str, version: &Version) -> String {
    format!("{name}@{version}")
}

/// Lifecycle state of a plugin in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Unloaded,
    Loaded,
    Initialized,
    Running,
    Paused,
    Stopped,
    Error,
}

impl Default for PluginStatus {
    fn default() -> Self {
        Self::Unloaded
    }
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Valid transitions. Any transition may instead land in `Error`;
    /// `Error` returns to `Unloaded` only via explicit reset.
    pub fn valid_transitions(&self) -> &'static [PluginStatus] {
        match self {
            Self::Unloaded => &[Self::Loaded],
            Self::Loaded => &[Self::Initialized, Self::Unloaded],
            Self::Initialized => &[Self::Running, Self::Stopped],
            Self::Running => &[Self::Paused, Self::Stopped],
            Self::Paused => &[Self::Running, Self::Stopped],
            Self::Stopped => &[Self::Unloaded],
            Self::Error => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        new_status == Self::Error || self.valid_transitions().contains(&new_status)
    }
}

/// Semver constraint on a plugin dependency. Excluded versions dominate
/// allowed; prerelease and build suffixes are rejected unless permitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionConstraint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<Version>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_versions: BTreeSet<Version>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub excluded_versions: BTreeSet<Version>,
    #[serde(default)]
    pub require_exact_match: Option<Version>,
    #[serde(default)]
    pub allow_prerelease: bool,
    #[serde(default)]
    pub allow_build: bool,
}

impl VersionConstraint {
    /// Accept any version.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn at_least(version: Version) -> Self {
        Self {
            min_version: Some(version),
            ..Self::default()
        }
    }

    pub fn exact(version: Version) -> Self {
        Self {
            require_exact_match: Some(version),
            ..Self::default()
        }
    }

    /// Whether `version` satisfies this constraint.
    pub fn matches(&self, version: &Version) -> bool {
        if !self.allow_prerelease && version.pre != Prerelease::EMPTY {
            return false;
        }
        if !self.allow_build && !version.build.is_empty() {
            return false;
        }
        // Blacklist dominates everything else.
        if self.excluded_versions.contains(version) {
            return false;
        }
        if let Some(exact) = &self.require_exact_match {
            return version == exact;
        }
        // Whitelist dominates the range when present.
        if !self.allowed_versions.is_empty() {
            return self.allowed_versions.contains(version);
        }
        if let Some(min) = &self.min_version {
            if version < min {
                return false;
            }
        }
        if let Some(max) = &self.max_version {
            if version > max {
                return false;
            }
        }
        true
    }
}

/// Rolling success rate and mean duration, EMA-updated per outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PluginScore {
    /// Success rate in [0, 1]; new plugins start healthy
    pub success_rate: f64,
    /// Mean execution duration in milliseconds
    pub mean_duration_ms: f64,
    /// Total recorded outcomes
    pub observations: u64,
}

impl Default for PluginScore {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            mean_duration_ms: 0.0,
            observations: 0,
        }
    }
}

impl PluginScore {
    /// Fold one outcome into the score.
    pub fn update(&mut self, success: bool, duration_ms: u64) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate =
            ((1.0 - SCORE_ALPHA) * self.success_rate + SCORE_ALPHA * outcome).clamp(0.0, 1.0);
        if self.observations == 0 {
            self.mean_duration_ms = duration_ms as f64;
        } else {
            self.mean_duration_ms =
                (1.0 - SCORE_ALPHA) * self.mean_duration_ms + SCORE_ALPHA * duration_ms as f64;
        }
        self.observations += 1;
    }

    pub fn is_healthy(&self, threshold: f64) -> bool {
        self.success_rate >= threshold
    }
}

/// Catalog metadata for an installable plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin name, unique together with `version`
    pub name: String,
    /// Semver version
    pub version: Version,
    pub author: String,
    pub description: String,
    /// Capability tags this plugin advertises
    pub capabilities: BTreeSet<String>,
    /// Dependencies on other plugins, by name
    pub dependencies: BTreeMap<String, VersionConstraint>,
    /// Quota applied when the sandbox runs this plugin
    pub resource_limits: ResourceQuota,
    /// Concurrent `execute` calls permitted; 1 serializes per plugin
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Whether the plugin may run in-process (operator promotion)
    #[serde(default)]
    pub trusted: bool,
    /// Content hash of the materialized source
    #[serde(default)]
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

fn default_max_concurrent() -> usize {
    1
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            author: String::new(),
            description: String::new(),
            capabilities: BTreeSet::new(),
            dependencies: BTreeMap::new(),
            resource_limits: ResourceQuota::default(),
            max_concurrent: 1,
            trusted: false,
            content_hash: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.insert(cap.into());
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>, constraint: VersionConstraint) -> Self {
        self.dependencies.insert(name.into(), constraint);
        self
    }

    pub fn with_trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    /// Deterministic id for this metadata.
    pub fn id(&self) -> String {
        plugin_id(&self.name, &self.version)
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.contains(cap)
    }
}
