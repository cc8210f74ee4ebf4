//! Runtime checkpoints: periodic coherent snapshots written with an
//! atomic rename, restored on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::agent::Agent;
use crate::domain::models::capability::CapabilityGap;
use crate::domain::models::goal::Goal;
use crate::domain::models::resource::ResourcePool;
use crate::domain::models::task::Task;
use crate::infrastructure::storage::SnapshotStore;
use crate::services::registry::PluginSummary;

/// A coherent checkpoint of runtime state.
///
/// Every collection is sorted and every map is ordered, so a
/// deserialize/re-serialize round trip is byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    /// Monotonic within one process lifetime
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub goals: Vec<Goal>,
    pub tasks: Vec<Task>,
    pub plugins: Vec<PluginSummary>,
    pub agents: Vec<Agent>,
    pub gaps: Vec<CapabilityGap>,
    pub pools: BTreeMap<String, ResourcePool>,
}

impl RuntimeSnapshot {
    pub fn serialize(&self) -> RuntimeResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| RuntimeError::Snapshot(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> RuntimeResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| RuntimeError::Snapshot(e.to_string()))
    }
}

/// Writes and reads checkpoints through a retention-bounded store.
pub struct SnapshotService {
    store: SnapshotStore,
    sequence: AtomicU64,
}

impl SnapshotService {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            sequence: AtomicU64::new(1),
        }
    }

    /// Persist a snapshot; assigns the sequence number.
    pub fn write(&self, mut snapshot: RuntimeSnapshot) -> RuntimeResult<()> {
        snapshot.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        snapshot.taken_at = Utc::now();
        let bytes = snapshot.serialize()?;
        self.store.write(&bytes)?;
        tracing::debug!(sequence = snapshot.sequence, "Snapshot written");
        Ok(())
    }

    /// Load the most recent snapshot. A present-but-unreadable snapshot
    /// is fatal; an absent one means a fresh start.
    pub fn read_latest(&self) -> RuntimeResult<Option<RuntimeSnapshot>> {
        match self.store.read_latest()? {
            Some(bytes) => {
                let snapshot = RuntimeSnapshot::deserialize(&bytes)?;
                self.sequence
                    .store(snapshot.sequence + 1, Ordering::Relaxed);
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::task::TaskStatus;
    use uuid::Uuid;

    fn sample_snapshot() -> RuntimeSnapshot {
        let goal = Goal::new("snapshot goal", 3);
        let mut task = Task::new(goal.id, "fetch", 3);
        task.transition_to(TaskStatus::Claimed).unwrap();
        task.claimed_by = Some(Uuid::new_v4());
        let mut pools = BTreeMap::new();
        pools.insert("memory_mb".to_string(), ResourcePool::new("memory_mb", 1024.0));
        RuntimeSnapshot {
            sequence: 0,
            taken_at: Utc::now(),
            goals: vec![goal],
            tasks: vec![task],
            plugins: Vec::new(),
            agents: Vec::new(),
            gaps: Vec::new(),
            pools,
        }
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let snapshot = sample_snapshot();
        let first = snapshot.serialize().unwrap();
        let reloaded = RuntimeSnapshot::deserialize(&first).unwrap();
        let second = reloaded.serialize().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_write_and_read_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let service = SnapshotService::new(SnapshotStore::new(tmp.path().to_path_buf(), 2));

        service.write(sample_snapshot()).unwrap();
        service.write(sample_snapshot()).unwrap();
        let latest = service.read_latest().unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.goals.len(), 1);
    }

    #[test]
    fn test_corrupt_snapshot_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path().to_path_buf(), 2);
        store.write(b"{not json").unwrap();

        let service = SnapshotService::new(store);
        let err = service.read_latest().unwrap_err();
        assert!(matches!(err, RuntimeError::Snapshot(_)));
    }

    #[test]
    fn test_missing_snapshot_is_fresh_start() {
        let tmp = tempfile::tempdir().unwrap();
        let service = SnapshotService::new(SnapshotStore::new(tmp.path().to_path_buf(), 2));
        assert!(service.read_latest().unwrap().is_none());
    }
}
