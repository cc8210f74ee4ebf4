//! Runtime wiring: every component is owned here, constructed in `main`
//! (or a test) and passed explicitly. No component reaches for a global.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::plugin::{PluginMetadata, PluginStatus};
use crate::domain::models::Config;
use crate::domain::ports::PluginHandle;
use crate::infrastructure::storage::{self, DataDir, SnapshotStore};
use crate::services::agent_manager::AgentManager;
use crate::services::monitor::ResourceMonitor;
use crate::services::orchestrator::Orchestrator;
use crate::services::registry::PluginRegistry;
use crate::services::sandbox::SandboxExecutor;
use crate::services::scheduler::TaskScheduler;
use crate::services::snapshot::{RuntimeSnapshot, SnapshotService};
use crate::services::synthesizer::PluginSynthesizer;
use crate::services::transform::{TransformPlugin, TransformSpec};

/// Capacity of the capability-gap channel; a full queue backpressures
/// reporting workers.
const GAP_CHANNEL_CAPACITY: usize = 64;

/// Handles for the runtime's background loops.
pub struct RuntimeHandles {
    pub shutdown: CancellationToken,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

impl RuntimeHandles {
    /// Stop every loop and wait for them to wind down.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

/// The assembled runtime.
pub struct Runtime {
    pub config: Config,
    pub data_dir: DataDir,
    pub monitor: Arc<ResourceMonitor>,
    pub registry: Arc<PluginRegistry>,
    pub scheduler: Arc<TaskScheduler>,
    pub sandbox: Arc<SandboxExecutor>,
    pub synthesizer: Arc<PluginSynthesizer>,
    pub manager: Arc<AgentManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub snapshots: SnapshotService,
}

impl Runtime {
    /// Build the runtime from configuration: open the data dir, wire the
    /// components, register builtin plugins, rescan the plugin store,
    /// and restore the latest snapshot if one exists.
    pub async fn new(config: Config) -> RuntimeResult<Arc<Self>> {
        Self::build(config, false).await
    }

    /// Build with in-process synthesis candidates (embedded use, tests).
    pub async fn new_in_process(config: Config) -> RuntimeResult<Arc<Self>> {
        Self::build(config, true).await
    }

    async fn build(config: Config, in_process: bool) -> RuntimeResult<Arc<Self>> {
        let data_dir = DataDir::open(config.data_dir.clone())?;
        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone(), &config.pools));
        let registry = Arc::new(PluginRegistry::new());
        let scheduler = Arc::new(TaskScheduler::new());
        let sandbox = Arc::new(SandboxExecutor::new(
            config.sandbox.clone(),
            Arc::clone(&registry),
            Arc::clone(&monitor),
        ));
        let mut synthesizer = PluginSynthesizer::new(
            config.synthesis.clone(),
            Arc::clone(&registry),
            Arc::clone(&sandbox),
            data_dir.clone(),
        );
        if in_process {
            synthesizer = synthesizer.with_in_process_candidates();
        }
        let synthesizer = Arc::new(synthesizer);

        let (gap_tx, gap_rx) = mpsc::channel(GAP_CHANNEL_CAPACITY);
        let manager = Arc::new(AgentManager::new(
            config.agents.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&registry),
            Arc::clone(&sandbox),
            Arc::clone(&monitor),
            gap_tx.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&registry),
            Arc::clone(&manager),
            Arc::clone(&synthesizer),
            Arc::clone(&monitor),
            data_dir.clone(),
            gap_tx,
            gap_rx,
        ));
        let snapshots = SnapshotService::new(SnapshotStore::new(
            data_dir.snapshots(),
            config.snapshot.retain,
        ));

        let runtime = Arc::new(Self {
            config,
            data_dir,
            monitor,
            registry,
            scheduler,
            sandbox,
            synthesizer,
            manager,
            orchestrator,
            snapshots,
        });

        runtime.register_builtins().await?;
        runtime.rescan_plugin_store().await;
        runtime.restore_from_snapshot().await?;
        Ok(runtime)
    }

    /// Builtin trusted plugins every deployment carries.
    async fn register_builtins(&self) -> RuntimeResult<()> {
        let echo = PluginMetadata::new("echo", semver::Version::new(1, 0, 0))
            .with_capability("echo")
            .with_trusted(true);
        self.registry
            .register(
                echo,
                PluginHandle::Native(Arc::new(TransformPlugin::new(TransformSpec::Identity))),
            )
            .await?;
        Ok(())
    }

    /// Startup-time manifest scan of the plugin store.
    async fn rescan_plugin_store(&self) {
        let manifests = match storage::scan_plugin_manifests(&self.data_dir) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Plugin store scan failed");
                return;
            }
        };
        for (metadata, plugin_dir) in manifests {
            let handle = if metadata.trusted {
                match TransformPlugin::load(&plugin_dir) {
                    Ok(plugin) => PluginHandle::Native(Arc::new(plugin)),
                    Err(_) => PluginHandle::Command {
                        program: self.sandbox.default_runner(),
                        args: Vec::new(),
                        plugin_dir,
                    },
                }
            } else {
                PluginHandle::Command {
                    program: self.sandbox.default_runner(),
                    args: Vec::new(),
                    plugin_dir,
                }
            };
            let id = metadata.id();
            if let Err(e) = self.registry.register(metadata, handle).await {
                warn!(plugin_id = %id, error = %e, "Stored plugin not re-registered");
            }
        }
    }

    /// Restore state from the latest snapshot. A corrupt snapshot is
    /// fatal; an absent one is a fresh start.
    async fn restore_from_snapshot(&self) -> RuntimeResult<()> {
        let Some(snapshot) = self.snapshots.read_latest()? else {
            return Ok(());
        };
        info!(
            sequence = snapshot.sequence,
            goals = snapshot.goals.len(),
            tasks = snapshot.tasks.len(),
            "Restoring from snapshot"
        );

        self.scheduler
            .restore(snapshot.goals, snapshot.tasks)
            .await;
        self.manager.restore(snapshot.agents).await;
        self.orchestrator.restore_gaps(snapshot.gaps).await;
        self.registry.restore_scores(&snapshot.plugins).await;

        // Pool allocations belonged to workers that no longer exist;
        // capacities survive, usage resets.
        let pools: BTreeMap<_, _> = snapshot
            .pools
            .into_iter()
            .map(|(name, mut pool)| {
                pool.used = 0.0;
                pool.reserved = 0.0;
                (name, pool)
            })
            .collect();
        self.monitor.restore_pools(pools)?;

        for pool in self.monitor.pool_snapshot().values() {
            if !pool.is_consistent() {
                return Err(RuntimeError::Internal(format!(
                    "Pool {} negative after restore",
                    pool.name
                )));
            }
        }
        Ok(())
    }

    /// Capture a coherent snapshot of every component.
    pub async fn capture_snapshot(&self) -> RuntimeSnapshot {
        let (goals, tasks) = self.scheduler.snapshot().await;
        RuntimeSnapshot {
            sequence: 0,
            taken_at: chrono::Utc::now(),
            goals,
            tasks,
            plugins: self.registry.snapshot().await,
            agents: self.manager.fleet().await,
            gaps: self.orchestrator.capability_gaps().await,
            pools: self.monitor.pool_snapshot(),
        }
    }

    /// Write a snapshot now.
    pub async fn snapshot_now(&self) -> RuntimeResult<()> {
        let snapshot = self.capture_snapshot().await;
        self.snapshots.write(snapshot)
    }

    /// Refuse to unregister a plugin still referenced by live tasks.
    pub async fn unregister_plugin(&self, plugin_id: &str) -> RuntimeResult<()> {
        let using = self.scheduler.tasks_using_plugin(plugin_id).await;
        if !using.is_empty() {
            return Err(RuntimeError::ValidationFailed(format!(
                "Plugin {plugin_id} is referenced by {} live tasks",
                using.len()
            )));
        }
        self.registry.unregister(plugin_id).await
    }

    /// Operator promotion to in-process execution, gated on health.
    pub async fn promote_plugin(&self, plugin_id: &str) -> RuntimeResult<()> {
        let summary = self
            .registry
            .get(plugin_id)
            .await
            .ok_or_else(|| RuntimeError::PluginNotFound(plugin_id.to_string()))?;
        if summary.status != PluginStatus::Running
            || !summary
                .score
                .is_healthy(crate::domain::models::DEFAULT_HEALTH_THRESHOLD)
        {
            return Err(RuntimeError::ValidationFailed(format!(
                "Plugin {plugin_id} is not healthy enough to promote"
            )));
        }
        self.registry.promote(plugin_id).await
    }

    /// Launch the background loops.
    pub fn start(self: &Arc<Self>) -> RuntimeHandles {
        let shutdown = CancellationToken::new();
        let mut joins = Vec::new();

        let monitor_join = self.monitor.start();
        let monitor = Arc::clone(&self.monitor);
        let monitor_shutdown = shutdown.clone();
        joins.push(tokio::spawn(async move {
            monitor_shutdown.cancelled().await;
            monitor.shutdown();
            let _ = monitor_join.await;
        }));

        joins.push(self.manager.start_maintenance(shutdown.child_token()));
        joins.push(self.orchestrator.start(shutdown.child_token()));

        // Checkpoint loop.
        let runtime = Arc::clone(self);
        let snapshot_shutdown = shutdown.child_token();
        joins.push(tokio::spawn(async move {
            let cadence = Duration::from_secs(runtime.config.snapshot.interval_secs.max(1));
            let mut tick = interval(cadence);
            loop {
                tokio::select! {
                    _ = snapshot_shutdown.cancelled() => {
                        // One final checkpoint on the way out.
                        if let Err(e) = runtime.snapshot_now().await {
                            warn!(error = %e, "Final snapshot failed");
                        }
                        break;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = runtime.snapshot_now().await {
                            warn!(error = %e, "Snapshot failed");
                        }
                    }
                }
            }
        }));

        self.orchestrator.mark_initialized();
        info!("Runtime started");
        RuntimeHandles { shutdown, joins }
    }
}
