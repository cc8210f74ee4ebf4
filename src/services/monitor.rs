//! Resource monitor: per-owner sampling, quota enforcement, shared pools.
//!
//! Owners are plugin correlation ids, agent ids, or the literal `system`.
//! The monitor records violations and raises `QuotaExceeded` events; the
//! supervising component decides the response. It never kills on its own,
//! and a dropped sample never fails the process.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, ProcessesToUpdate, RefreshKind, System};
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::config::MonitorConfig;
use crate::domain::models::resource::{
    ResourceAxis, ResourcePool, ResourceQuota, ResourceSample, RollingWindow,
};

/// Owner id used for whole-process samples.
pub const SYSTEM_OWNER: &str = "system";

/// Events broadcast by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MonitorEvent {
    /// A sample was recorded for an owner
    Sample {
        owner: String,
        sample: ResourceSample,
    },
    /// An owner crossed its quota threshold on one axis
    QuotaExceeded { owner: String, axis: ResourceAxis },
    /// Monitor shutdown
    Shutdown,
}

/// Usage summary for one owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub owner: String,
    pub latest: Option<ResourceSample>,
    pub peaks: BTreeMap<String, f64>,
    pub averages: BTreeMap<String, f64>,
    pub samples: usize,
}

#[derive(Debug, Default)]
struct OwnerState {
    quota: Option<ResourceQuota>,
    pid: Option<u32>,
    window: RollingWindow,
    /// Per-axis violation flags over the last `violation_window` samples.
    recent_violations: HashMap<ResourceAxis, VecDeque<bool>>,
}

/// Background resource monitor.
///
/// Uses tokio primitives for concurrent monitoring: `RwLock` for owner
/// state, a broadcast channel for one-to-many event notification, an
/// interval timer for cadence, and `select!` for graceful shutdown.
pub struct ResourceMonitor {
    config: MonitorConfig,
    owners: RwLock<HashMap<String, OwnerState>>,
    /// Shared pool capacities. A std mutex so drop guards can release
    /// without an async context.
    pools: Arc<Mutex<BTreeMap<String, ResourcePool>>>,
    system: RwLock<System>,
    event_tx: broadcast::Sender<MonitorEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, pool_capacities: &BTreeMap<String, f64>) -> Self {
        let refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything());
        let system = System::new_with_specifics(refresh);

        let pools = pool_capacities
            .iter()
            .map(|(name, capacity)| (name.clone(), ResourcePool::new(name.clone(), *capacity)))
            .collect();

        let (event_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            owners: RwLock::new(HashMap::new()),
            pools: Arc::new(Mutex::new(pools)),
            system: RwLock::new(system),
            event_tx,
            shutdown_tx,
        }
    }

    /// Subscribe to monitor events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_tx.subscribe()
    }

    /// Register an owner, optionally with a quota and an OS process to
    /// attribute samples to.
    pub async fn register_owner(
        &self,
        owner: impl Into<String>,
        quota: Option<ResourceQuota>,
        pid: Option<u32>,
    ) {
        let owner = owner.into();
        let mut owners = self.owners.write().await;
        let state = owners.entry(owner.clone()).or_default();
        state.quota = quota;
        state.pid = pid;
        debug!(owner = %owner, pid, "Owner registered with monitor");
    }

    /// Drop an owner and its window.
    pub async fn unregister_owner(&self, owner: &str) {
        self.owners.write().await.remove(owner);
    }

    /// Set or replace an owner's quota.
    pub async fn set_quota(&self, owner: &str, quota: ResourceQuota) {
        let mut owners = self.owners.write().await;
        owners.entry(owner.to_string()).or_default().quota = Some(quota);
    }

    /// Usage summary for one owner.
    pub async fn get_usage(&self, owner: &str) -> Option<ResourceUsage> {
        let owners = self.owners.read().await;
        let state = owners.get(owner)?;
        let mut peaks = BTreeMap::new();
        let mut averages = BTreeMap::new();
        for axis in ResourceAxis::all() {
            peaks.insert(axis.as_str().to_string(), state.window.peak(*axis));
            averages.insert(axis.as_str().to_string(), state.window.average(*axis));
        }
        Some(ResourceUsage {
            owner: owner.to_string(),
            latest: state.window.latest().copied(),
            peaks,
            averages,
            samples: state.window.len(),
        })
    }

    /// Record an externally measured sample for an owner (the sandbox
    /// attributes in-process measurements this way) and run quota checks.
    pub async fn record_sample(&self, owner: &str, sample: ResourceSample) {
        let violations = {
            let mut owners = self.owners.write().await;
            let state = owners.entry(owner.to_string()).or_default();
            Self::ingest(state, sample, self.config.violation_window, self.config.violation_threshold)
        };
        let _ = self.event_tx.send(MonitorEvent::Sample {
            owner: owner.to_string(),
            sample,
        });
        for axis in violations {
            warn!(owner, axis = %axis, "Quota exceeded");
            let _ = self.event_tx.send(MonitorEvent::QuotaExceeded {
                owner: owner.to_string(),
                axis,
            });
        }
    }

    /// Capture one sample per registered owner plus the system owner.
    pub async fn sample(&self) {
        let pids: Vec<(String, Option<u32>)> = {
            let owners = self.owners.read().await;
            owners
                .iter()
                .map(|(name, state)| (name.clone(), state.pid))
                .collect()
        };

        let mut measured: Vec<(String, ResourceSample)> = Vec::with_capacity(pids.len() + 1);
        {
            let mut system = self.system.write().await;
            system.refresh_cpu_all();
            system.refresh_memory();
            let tracked: Vec<Pid> = pids
                .iter()
                .filter_map(|(_, pid)| pid.map(Pid::from_u32))
                .collect();
            if !tracked.is_empty() {
                system.refresh_processes(ProcessesToUpdate::Some(&tracked), true);
            }

            let mut system_sample = ResourceSample::zero();
            system_sample.cpu_percent = f64::from(system.global_cpu_usage());
            system_sample.memory_mb = system.used_memory() as f64 / 1024.0 / 1024.0;
            system_sample.timestamp = Utc::now();
            measured.push((SYSTEM_OWNER.to_string(), system_sample));

            for (owner, pid) in &pids {
                let Some(pid) = pid else { continue };
                let Some(process) = system.process(Pid::from_u32(*pid)) else {
                    // Process gone between registration and sampling; a
                    // dropped sample is tolerated.
                    debug!(owner = %owner, pid, "Sample dropped, process missing");
                    continue;
                };
                let mut sample = ResourceSample::zero();
                sample.cpu_percent = f64::from(process.cpu_usage());
                sample.memory_mb = process.memory() as f64 / 1024.0 / 1024.0;
                sample.threads = read_thread_count(*pid).unwrap_or(0);
                sample.open_files = read_fd_count(*pid).unwrap_or(0);
                sample.timestamp = Utc::now();
                measured.push((owner.clone(), sample));
            }
        }

        for (owner, sample) in measured {
            self.record_sample(&owner, sample).await;
        }
    }

    /// Fold a sample into an owner window and return axes that crossed
    /// the violation threshold.
    fn ingest(
        state: &mut OwnerState,
        sample: ResourceSample,
        window: usize,
        threshold: u32,
    ) -> Vec<ResourceAxis> {
        state.window.push(sample);

        let Some(quota) = state.quota else {
            return Vec::new();
        };
        let violated_now = sample.violations(&quota);

        let mut raised = Vec::new();
        for axis in ResourceAxis::all() {
            let flags = state.recent_violations.entry(*axis).or_default();
            flags.push_back(violated_now.contains(axis));
            while flags.len() > window {
                flags.pop_front();
            }
            let count = flags.iter().filter(|v| **v).count() as u32;
            if count >= threshold {
                flags.clear();
                raised.push(*axis);
            }
        }
        raised
    }

    /// Start the background sampling loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let cadence = Duration::from_secs(self.config.interval_secs.max(1));

        tokio::spawn(async move {
            let mut tick = interval(cadence);
            info!(
                interval_secs = cadence.as_secs(),
                "Resource monitor started"
            );
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        monitor.sample().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Resource monitor shutting down");
                        let _ = monitor.event_tx.send(MonitorEvent::Shutdown);
                        break;
                    }
                }
            }
        })
    }

    /// Signal the sampling loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Monitor sampling interval as a chrono duration, used for
    /// heartbeat staleness tolerances.
    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.interval_secs.max(1) as i64)
    }

    // ------------------------------------------------------------------
    // Shared pools
    // ------------------------------------------------------------------

    /// Allocate from a named pool. The returned guard releases the
    /// allocation when dropped.
    pub fn allocate(&self, pool: &str, amount: f64) -> RuntimeResult<PoolAllocation> {
        let mut pools = self.pools.lock().expect("pool lock poisoned");
        let entry = pools
            .get_mut(pool)
            .ok_or_else(|| RuntimeError::InsufficientResources(format!("No pool named {pool}")))?;
        entry
            .allocate(amount)
            .map_err(RuntimeError::InsufficientResources)?;
        Ok(PoolAllocation {
            pools: Arc::clone(&self.pools),
            pool: pool.to_string(),
            amount,
        })
    }

    /// Whether every requested amount fits its pool right now.
    pub fn can_allocate(&self, wanted: &BTreeMap<String, f64>) -> bool {
        let pools = self.pools.lock().expect("pool lock poisoned");
        wanted.iter().all(|(name, amount)| {
            pools
                .get(name)
                .map(|p| p.available() >= *amount)
                .unwrap_or(false)
        })
    }

    /// Current pool states, for stats and snapshots.
    pub fn pool_snapshot(&self) -> BTreeMap<String, ResourcePool> {
        self.pools.lock().expect("pool lock poisoned").clone()
    }

    /// Restore pool states from a snapshot, rejecting inconsistent pools.
    pub fn restore_pools(&self, restored: BTreeMap<String, ResourcePool>) -> RuntimeResult<()> {
        for pool in restored.values() {
            if !pool.is_consistent() {
                return Err(RuntimeError::Internal(format!(
                    "Pool {} inconsistent in snapshot",
                    pool.name
                )));
            }
        }
        *self.pools.lock().expect("pool lock poisoned") = restored;
        Ok(())
    }
}

/// RAII pool allocation: released on scope exit.
#[derive(Debug)]
pub struct PoolAllocation {
    pools: Arc<Mutex<BTreeMap<String, ResourcePool>>>,
    pool: String,
    amount: f64,
}

impl PoolAllocation {
    pub fn amount(&self) -> f64 {
        self.amount
    }
}

impl Drop for PoolAllocation {
    fn drop(&mut self) {
        if let Ok(mut pools) = self.pools.lock() {
            if let Some(pool) = pools.get_mut(&self.pool) {
                pool.release(self.amount);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn read_thread_count(pid: u32) -> Option<u32> {
    let entries = std::fs::read_dir(format!("/proc/{pid}/task")).ok()?;
    Some(entries.count() as u32)
}

#[cfg(target_os = "linux")]
fn read_fd_count(pid: u32) -> Option<u32> {
    let entries = std::fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
    Some(entries.count() as u32)
}

#[cfg(not(target_os = "linux"))]
fn read_thread_count(_pid: u32) -> Option<u32> {
    None
}

#[cfg(not(target_os = "linux"))]
fn read_fd_count(_pid: u32) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_monitor() -> Arc<ResourceMonitor> {
        let mut pools = BTreeMap::new();
        pools.insert("memory_mb".to_string(), 100.0);
        Arc::new(ResourceMonitor::new(MonitorConfig::default(), &pools))
    }

    fn sample_with_memory(mb: f64) -> ResourceSample {
        let mut sample = ResourceSample::zero();
        sample.memory_mb = mb;
        sample
    }

    #[tokio::test]
    async fn test_three_violations_raise_quota_event() {
        let monitor = test_monitor();
        let mut events = monitor.subscribe();

        let quota = ResourceQuota {
            memory_mb: 64,
            ..ResourceQuota::default()
        };
        monitor.register_owner("plugin-1", Some(quota), None).await;

        for _ in 0..3 {
            monitor.record_sample("plugin-1", sample_with_memory(80.0)).await;
        }

        let mut saw_quota = false;
        while let Ok(event) = events.try_recv() {
            if let MonitorEvent::QuotaExceeded { owner, axis } = event {
                assert_eq!(owner, "plugin-1");
                assert_eq!(axis, ResourceAxis::Memory);
                saw_quota = true;
            }
        }
        assert!(saw_quota, "third violation raises the event");
    }

    #[tokio::test]
    async fn test_two_violations_do_not_raise() {
        let monitor = test_monitor();
        let mut events = monitor.subscribe();

        let quota = ResourceQuota {
            memory_mb: 64,
            ..ResourceQuota::default()
        };
        monitor.register_owner("plugin-1", Some(quota), None).await;

        monitor.record_sample("plugin-1", sample_with_memory(80.0)).await;
        monitor.record_sample("plugin-1", sample_with_memory(50.0)).await;
        monitor.record_sample("plugin-1", sample_with_memory(80.0)).await;

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, MonitorEvent::QuotaExceeded { .. }),
                "two violations in the window must not raise"
            );
        }
    }

    #[tokio::test]
    async fn test_usage_reports_peaks() {
        let monitor = test_monitor();
        monitor.register_owner("agent-1", None, None).await;
        monitor.record_sample("agent-1", sample_with_memory(10.0)).await;
        monitor.record_sample("agent-1", sample_with_memory(40.0)).await;

        let usage = monitor.get_usage("agent-1").await.unwrap();
        assert_eq!(usage.samples, 2);
        assert!((usage.peaks["memory"] - 40.0).abs() < f64::EPSILON);
        assert!((usage.averages["memory"] - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_pool_guard_releases_on_drop() {
        let monitor = test_monitor();
        {
            let _alloc = monitor.allocate("memory_mb", 60.0).unwrap();
            assert!(monitor.allocate("memory_mb", 50.0).is_err());
        }
        // Guard dropped; the pool is whole again.
        assert!(monitor.allocate("memory_mb", 50.0).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_pool_refused() {
        let monitor = test_monitor();
        assert!(monitor.allocate("gpus", 1.0).is_err());
    }

    #[tokio::test]
    async fn test_can_allocate() {
        let monitor = test_monitor();
        let mut wanted = BTreeMap::new();
        wanted.insert("memory_mb".to_string(), 80.0);
        assert!(monitor.can_allocate(&wanted));

        let _held = monitor.allocate("memory_mb", 50.0).unwrap();
        assert!(!monitor.can_allocate(&wanted));
    }
}
