//! Plugin registry: versioned catalog, capability lookup, lifecycle
//! state machine, and rolling scores.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::plugin::{
    plugin_id, PluginMetadata, PluginScore, PluginStatus, VersionConstraint,
    DEFAULT_HEALTH_THRESHOLD,
};
use crate::domain::ports::PluginHandle;

/// Events broadcast by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered { plugin_id: String },
    /// Rolling score fell below the health threshold
    Demoted { plugin_id: String },
    Unregistered { plugin_id: String },
}

/// One catalog entry.
#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub metadata: PluginMetadata,
    pub status: PluginStatus,
    pub score: PluginScore,
    /// Implementation, resolved at load time; absent once unloaded
    pub handle: Option<PluginHandle>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Serializable view of a record, used by snapshots and the HTTP facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSummary {
    pub plugin_id: String,
    pub metadata: PluginMetadata,
    pub status: PluginStatus,
    pub score: PluginScore,
    pub registered_at: DateTime<Utc>,
}

/// Versioned plugin catalog.
pub struct PluginRegistry {
    records: RwLock<HashMap<String, PluginRecord>>,
    health_threshold: f64,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            records: RwLock::new(HashMap::new()),
            health_threshold: DEFAULT_HEALTH_THRESHOLD,
            event_tx,
        }
    }

    pub fn with_health_threshold(mut self, threshold: f64) -> Self {
        self.health_threshold = threshold;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Register a plugin and activate it. The id is deterministic from
    /// `(name, version)`, so unregister-then-register round-trips.
    pub async fn register(
        &self,
        mut metadata: PluginMetadata,
        handle: PluginHandle,
    ) -> RuntimeResult<String> {
        let id = metadata.id();
        if metadata.content_hash.is_empty() {
            // Hash whatever identifies the implementation; command
            // plugins hash their materialized dir path as a fallback.
            metadata.content_hash = match &handle {
                PluginHandle::Command { plugin_dir, .. } => {
                    content_hash(plugin_dir.display().to_string().as_bytes())
                }
                PluginHandle::Native(_) => content_hash(id.as_bytes()),
            };
        }

        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&id) {
            if existing.status != PluginStatus::Unloaded {
                return Err(RuntimeError::ValidationFailed(format!(
                    "Plugin {id} already registered"
                )));
            }
        }

        // Walk the lifecycle to running; a dependency shortfall leaves the
        // plugin initialized until its dependencies arrive.
        let mut record = PluginRecord {
            metadata,
            status: PluginStatus::Loaded,
            score: PluginScore::default(),
            handle: Some(handle),
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        };
        record.status = PluginStatus::Initialized;

        let deps_ok = dependencies_ok(&record.metadata, &records);
        if deps_ok {
            record.status = PluginStatus::Running;
        } else {
            warn!(plugin_id = %id, "Registered with unsatisfied dependencies");
        }

        records.insert(id.clone(), record);

        // A new arrival may complete the dependency set of plugins that
        // registered before it.
        let waiting: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.status == PluginStatus::Initialized)
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in waiting {
            let satisfied = records
                .get(&rid)
                .map(|r| dependencies_ok(&r.metadata, &records))
                .unwrap_or(false);
            if satisfied {
                if let Some(r) = records.get_mut(&rid) {
                    r.status = PluginStatus::Running;
                    r.updated_at = Utc::now();
                }
            }
        }
        drop(records);

        info!(plugin_id = %id, "Plugin registered");
        let _ = self.event_tx.send(RegistryEvent::Registered {
            plugin_id: id.clone(),
        });
        Ok(id)
    }

    /// Mark a plugin unloaded and drop its handle. Attempt history held
    /// elsewhere is never touched. Idempotent on already-unloaded entries.
    pub async fn unregister(&self, id: &str) -> RuntimeResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        if record.status == PluginStatus::Unloaded {
            return Ok(());
        }
        record.status = PluginStatus::Unloaded;
        record.handle = None;
        record.updated_at = Utc::now();
        drop(records);

        let _ = self.event_tx.send(RegistryEvent::Unregistered {
            plugin_id: id.to_string(),
        });
        Ok(())
    }

    /// Candidates for a capability: running, version-satisfying, healthy,
    /// ranked by score then recency.
    pub async fn resolve(
        &self,
        capability: &str,
        constraint: &VersionConstraint,
    ) -> Vec<PluginSummary> {
        let records = self.records.read().await;
        let mut matches: Vec<&PluginRecord> = records
            .values()
            .filter(|r| r.status == PluginStatus::Running)
            .filter(|r| r.metadata.has_capability(capability))
            .filter(|r| constraint.matches(&r.metadata.version))
            .filter(|r| r.score.is_healthy(self.health_threshold))
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .success_rate
                .partial_cmp(&a.score.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.registered_at.cmp(&a.registered_at))
        });

        matches.into_iter().map(summarize).collect()
    }

    /// Whether every dependency of `id` resolves to a running plugin whose
    /// version satisfies the declared constraint.
    pub async fn dependencies_satisfied(&self, id: &str) -> RuntimeResult<(bool, Vec<String>)> {
        let records = self.records.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        let missing: Vec<String> = record
            .metadata
            .dependencies
            .iter()
            .filter(|(name, constraint)| {
                !records.values().any(|candidate| {
                    candidate.status == PluginStatus::Running
                        && candidate.metadata.name == **name
                        && constraint.matches(&candidate.metadata.version)
                })
            })
            .map(|(name, _)| name.clone())
            .collect();
        Ok((missing.is_empty(), missing))
    }

    /// Fold one execution outcome into the rolling score. Demotes (and
    /// announces) when the score crosses below the health threshold.
    pub async fn update_score(&self, id: &str, success: bool, duration_ms: u64) {
        let demoted = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(id) else {
                return;
            };
            let was_healthy = record.score.is_healthy(self.health_threshold);
            record.score.update(success, duration_ms);
            record.updated_at = Utc::now();
            was_healthy && !record.score.is_healthy(self.health_threshold)
        };
        if demoted {
            warn!(plugin_id = %id, "Plugin demoted below health threshold");
            let _ = self.event_tx.send(RegistryEvent::Demoted {
                plugin_id: id.to_string(),
            });
        }
    }

    /// Handle for execution; only running plugins have one.
    pub async fn handle(&self, id: &str) -> RuntimeResult<(PluginMetadata, PluginHandle)> {
        let records = self.records.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        if record.status != PluginStatus::Running {
            return Err(RuntimeError::PluginNotFound(format!(
                "{id} is {}",
                record.status.as_str()
            )));
        }
        let handle = record
            .handle
            .clone()
            .ok_or_else(|| RuntimeError::PluginNotFound(format!("{id} has no handle")))?;
        Ok((record.metadata.clone(), handle))
    }

    pub async fn get(&self, id: &str) -> Option<PluginSummary> {
        self.records.read().await.get(id).map(summarize)
    }

    pub async fn list(&self) -> Vec<PluginSummary> {
        let records = self.records.read().await;
        let mut all: Vec<PluginSummary> = records.values().map(summarize).collect();
        all.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        all
    }

    /// Apply a lifecycle transition (pause, resume, stop).
    pub async fn transition(&self, id: &str, to: PluginStatus) -> RuntimeResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        if !record.status.can_transition_to(to) {
            return Err(RuntimeError::InvalidTransition {
                from: record.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        record.status = to;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Explicit reset: the only way out of the error state.
    pub async fn reset(&self, id: &str) -> RuntimeResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        if record.status != PluginStatus::Error {
            return Err(RuntimeError::InvalidTransition {
                from: record.status.as_str().to_string(),
                to: PluginStatus::Unloaded.as_str().to_string(),
            });
        }
        record.status = PluginStatus::Unloaded;
        record.handle = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Operator promotion: the plugin may run in-process from now on.
    pub async fn promote(&self, id: &str) -> RuntimeResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        record.metadata.trusted = true;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Next patch version for a plugin name; 1.0.0 for a new name.
    pub async fn next_version(&self, name: &str) -> Version {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| r.metadata.name == name)
            .map(|r| r.metadata.version.clone())
            .max()
            .map(|mut v| {
                v.patch += 1;
                v.pre = semver::Prerelease::EMPTY;
                v.build = semver::BuildMetadata::EMPTY;
                v
            })
            .unwrap_or_else(|| Version::new(1, 0, 0))
    }

    /// Serializable catalog view for snapshots.
    pub async fn snapshot(&self) -> Vec<PluginSummary> {
        self.list().await
    }

    /// Re-apply rolling scores and trust flags from a snapshot to
    /// already re-registered plugins.
    pub async fn restore_scores(&self, summaries: &[PluginSummary]) {
        let mut records = self.records.write().await;
        for summary in summaries {
            if let Some(record) = records.get_mut(&summary.plugin_id) {
                record.score = summary.score;
                record.metadata.trusted = summary.metadata.trusted;
            }
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(record: &PluginRecord) -> PluginSummary {
    PluginSummary {
        plugin_id: record.metadata.id(),
        metadata: record.metadata.clone(),
        status: record.status,
        score: record.score,
        registered_at: record.registered_at,
    }
}

fn dependencies_ok(metadata: &PluginMetadata, records: &HashMap<String, PluginRecord>) -> bool {
    metadata.dependencies.iter().all(|(name, constraint)| {
        records.values().any(|candidate| {
            candidate.status == PluginStatus::Running
                && candidate.metadata.name == *name
                && constraint.matches(&candidate.metadata.version)
        })
    })
}

fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

/// Free-standing helper so other components can derive ids consistently.
pub fn id_for(name: &str, version: &Version) -> String {
    plugin_id(name, version)
}
