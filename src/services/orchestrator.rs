//! Orchestrator: accepts goals, drives decomposition and fleet sizing,
//! and runs the control loop that services timeouts, synthesis requests,
//! demotions, and history persistence.

use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::agent::AgentRole;
use crate::domain::models::capability::{CapabilityGap, SynthesisRequirement};
use crate::domain::models::config::Config;
use crate::domain::models::goal::{Goal, GoalStatus, MIN_PLAN_CONFIDENCE};
use crate::domain::models::plugin::VersionConstraint;
use crate::domain::models::resource::ResourceQuota;
use crate::domain::models::task::{Task, TaskStatus};
use crate::infrastructure::storage::{self, DataDir};
use crate::services::agent_manager::AgentManager;
use crate::services::monitor::ResourceMonitor;
use crate::services::registry::{PluginRegistry, RegistryEvent};
use crate::services::scheduler::{SchedulerEvent, TaskScheduler};
use crate::services::synthesizer::PluginSynthesizer;

/// Control loop cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on executors spawned per goal; scaled down under
/// resource pressure.
const MAX_EXECUTORS_PER_GOAL: usize = 4;

/// Status view of a goal with its per-task summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalView {
    pub goal: Goal,
    pub tasks: Vec<TaskView>,
    pub error_counts: BTreeMap<String, usize>,
    /// Most recent transient errors, newest last, capped at three
    pub last_transient_errors: Vec<String>,
}

/// Per-task summary for callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub task_type: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub attempts: usize,
    pub error: Option<String>,
}

impl TaskView {
    fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            status: task.status,
            retry_count: task.retry_count,
            attempts: task.attempts.len(),
            error: task.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Uptime/status report for the facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeReport {
    pub start_time: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub status: String,
    pub metrics: BTreeMap<String, serde_json::Value>,
}

/// Drives goals from submission to terminal state.
pub struct Orchestrator {
    config: Config,
    scheduler: Arc<TaskScheduler>,
    registry: Arc<PluginRegistry>,
    manager: Arc<AgentManager>,
    synthesizer: Arc<PluginSynthesizer>,
    monitor: Arc<ResourceMonitor>,
    data_dir: DataDir,
    gap_tx: mpsc::Sender<SynthesisRequirement>,
    gap_rx: std::sync::Mutex<Option<mpsc::Receiver<SynthesisRequirement>>>,
    gaps: RwLock<Vec<CapabilityGap>>,
    started_at: DateTime<Utc>,
    initialized: AtomicBool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        scheduler: Arc<TaskScheduler>,
        registry: Arc<PluginRegistry>,
        manager: Arc<AgentManager>,
        synthesizer: Arc<PluginSynthesizer>,
        monitor: Arc<ResourceMonitor>,
        data_dir: DataDir,
        gap_tx: mpsc::Sender<SynthesisRequirement>,
        gap_rx: mpsc::Receiver<SynthesisRequirement>,
    ) -> Self {
        Self {
            config,
            scheduler,
            registry,
            manager,
            synthesizer,
            monitor,
            data_dir,
            gap_tx,
            gap_rx: std::sync::Mutex::new(Some(gap_rx)),
            gaps: RwLock::new(Vec::new()),
            started_at: Utc::now(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Relaxed);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Goal intake
    // ------------------------------------------------------------------

    /// Accept a goal: plan it through the planner role, register the
    /// task graph, and bring up a fleet sized to the plan.
    #[instrument(skip(self, description, required_capabilities), err)]
    pub async fn submit(
        &self,
        description: String,
        priority: i32,
        deadline: Option<DateTime<Utc>>,
        required_capabilities: BTreeSet<String>,
    ) -> RuntimeResult<Uuid> {
        let mut goal = Goal::new(description, priority);
        goal.required_capabilities = required_capabilities;
        goal.deadline = deadline;

        // 1. Decompose via the planner role.
        let decomposition = self.manager.plan(&goal).await?;
        let confidence = decomposition.confidence();
        if confidence < MIN_PLAN_CONFIDENCE {
            return Err(RuntimeError::InsufficientPlan {
                confidence,
                threshold: MIN_PLAN_CONFIDENCE,
            });
        }

        // 2. Eagerly request synthesis for declared-but-missing
        // capabilities when policy says so; lazily they surface as gaps
        // at claim time.
        if self.config.synthesis.eager {
            for capability in &decomposition.required_capabilities {
                let present = !self
                    .registry
                    .resolve(capability, &VersionConstraint::any())
                    .await
                    .is_empty();
                if !present {
                    let requirement = SynthesisRequirement::new(
                        capability.clone(),
                        format!("Declared by goal {}", goal.id),
                    );
                    let _ = self.gap_tx.send(requirement).await;
                }
            }
        }

        // 3. Register the task graph. Declared resource needs are
        // checked against the pools up front; a shortfall degrades
        // rather than rejects.
        if !decomposition.required_resources.is_empty()
            && !self.monitor.can_allocate(&decomposition.required_resources)
        {
            warn!(goal_id = %goal.id, "Declared resources exceed pool availability; proceeding degraded");
        }
        let goal_id = goal.id;
        let task_count = decomposition.tasks.len();
        self.scheduler.register_goal(goal, decomposition).await?;

        // 4. Bring up the fleet; scale down when spawns are refused.
        let spawned = self.spawn_fleet(goal_id, task_count).await;
        if spawned == 0 {
            warn!(goal_id = %goal_id, "No executors spawned; goal proceeds degraded");
        }
        self.scheduler.mark_goal_running(goal_id).await?;

        info!(goal_id = %goal_id, executors = spawned, "Goal accepted");
        Ok(goal_id)
    }

    /// Spawn up to the derived executor count, retrying each spawn with
    /// backoff before giving up and proceeding with fewer.
    async fn spawn_fleet(&self, goal_id: Uuid, task_count: usize) -> usize {
        let wanted = task_count.clamp(1, MAX_EXECUTORS_PER_GOAL);
        let mut spawned = 0;
        for _ in 0..wanted {
            let policy = ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(100))
                .with_max_elapsed_time(Some(Duration::from_secs(2)))
                .build();
            let manager = Arc::clone(&self.manager);
            let result = backoff::future::retry(policy, || {
                let manager = Arc::clone(&manager);
                async move {
                    manager
                        .spawn(
                            AgentRole::Executor,
                            BTreeSet::new(),
                            goal_id,
                            ResourceQuota::default(),
                        )
                        .await
                        .map_err(|e| match e {
                            RuntimeError::InsufficientResources(_) => {
                                backoff::Error::transient(e)
                            }
                            other => backoff::Error::permanent(other),
                        })
                }
            })
            .await;

            match result {
                Ok(_) => spawned += 1,
                Err(e) => {
                    warn!(goal_id = %goal_id, error = %e, "Fleet scaled down");
                    break;
                }
            }
        }
        spawned
    }

    /// Idempotent goal cancel: cascades to tasks, then terminates the
    /// agents that owned them.
    pub async fn cancel(&self, goal_id: Uuid) -> RuntimeResult<()> {
        let owners = self.scheduler.cancel_goal(goal_id).await?;
        let unique: HashSet<Uuid> = owners.into_iter().collect();
        for agent_id in unique {
            self.manager.terminate(agent_id).await;
        }
        Ok(())
    }

    /// Full status view for one goal.
    pub async fn goal_view(&self, goal_id: Uuid) -> RuntimeResult<GoalView> {
        let goal = self
            .scheduler
            .get_goal(goal_id)
            .await
            .ok_or(RuntimeError::GoalNotFound(goal_id))?;
        let tasks = self.scheduler.goal_tasks(goal_id).await;
        let mut error_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut transient: Vec<(chrono::DateTime<chrono::Utc>, String)> = Vec::new();
        for task in &tasks {
            for attempt in &task.attempts {
                if let Some(error) = &attempt.error {
                    *error_counts.entry(error.kind.as_str().to_string()).or_default() += 1;
                    if error.kind == crate::domain::errors::ErrorKind::Transient {
                        let at = attempt.completed_at.unwrap_or(attempt.started_at);
                        transient.push((at, error.message.clone()));
                    }
                }
            }
        }
        transient.sort_by_key(|(at, _)| *at);
        let last_transient_errors = transient
            .into_iter()
            .rev()
            .take(3)
            .rev()
            .map(|(_, message)| message)
            .collect();
        Ok(GoalView {
            goal,
            tasks: tasks.iter().map(TaskView::from_task).collect(),
            error_counts,
            last_transient_errors,
        })
    }

    /// Block until the goal reaches a terminal status.
    pub async fn wait_for_goal(&self, goal_id: Uuid) -> RuntimeResult<GoalStatus> {
        let mut events = self.scheduler.subscribe();
        if let Some(goal) = self.scheduler.get_goal(goal_id).await {
            if goal.status.is_terminal() {
                return Ok(goal.status);
            }
        } else {
            return Err(RuntimeError::GoalNotFound(goal_id));
        }
        loop {
            match events.recv().await {
                Ok(SchedulerEvent::GoalFinished {
                    goal_id: finished,
                    status,
                }) if finished == goal_id => return Ok(status),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Missed events; re-check directly.
                    if let Some(goal) = self.scheduler.get_goal(goal_id).await {
                        if goal.status.is_terminal() {
                            return Ok(goal.status);
                        }
                    }
                }
                Err(_) => {
                    return Err(RuntimeError::Internal(
                        "Scheduler event stream closed".to_string(),
                    ))
                }
            }
        }
    }

    /// Submit and drive to terminal state.
    pub async fn orchestrate(
        &self,
        description: String,
        priority: i32,
        required_capabilities: BTreeSet<String>,
    ) -> RuntimeResult<GoalStatus> {
        let goal_id = self
            .submit(description, priority, None, required_capabilities)
            .await?;
        self.wait_for_goal(goal_id).await
    }

    pub async fn capability_gaps(&self) -> Vec<CapabilityGap> {
        self.gaps.read().await.clone()
    }

    pub async fn restore_gaps(&self, gaps: Vec<CapabilityGap>) {
        *self.gaps.write().await = gaps;
    }

    /// Uptime report for the facade.
    pub async fn uptime(&self) -> UptimeReport {
        let goals = self.scheduler.list_goals().await;
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "goals_total".to_string(),
            serde_json::json!(goals.len()),
        );
        metrics.insert(
            "goals_active".to_string(),
            serde_json::json!(goals.iter().filter(|g| !g.status.is_terminal()).count()),
        );
        metrics.insert(
            "agents".to_string(),
            serde_json::json!(self.manager.fleet().await.len()),
        );
        UptimeReport {
            start_time: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            status: if self.is_initialized() {
                "running".to_string()
            } else {
                "starting".to_string()
            },
            metrics,
        }
    }

    // ------------------------------------------------------------------
    // Control loop
    // ------------------------------------------------------------------

    /// Start the control loop: timeouts, synthesis servicing, demotion
    /// handling, goal-history persistence, and fleet cleanup.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut gap_rx = self
            .gap_rx
            .lock()
            .expect("gap receiver lock poisoned")
            .take()
            .expect("control loop started twice");

        tokio::spawn(async move {
            let mut tick = interval(TICK_INTERVAL);
            let mut scheduler_rx = orchestrator.scheduler.subscribe();
            let mut registry_rx = orchestrator.registry.subscribe();
            info!("Orchestrator control loop started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let expired = orchestrator.scheduler.check_timeouts().await;
                        if !expired.is_empty() {
                            info!(count = expired.len(), "Timed-out tasks requeued");
                        }
                    }
                    requirement = gap_rx.recv() => {
                        match requirement {
                            Some(requirement) => orchestrator.service_gap(requirement).await,
                            None => break,
                        }
                    }
                    event = scheduler_rx.recv() => {
                        if let Ok(event) = event {
                            orchestrator.on_scheduler_event(event).await;
                        }
                    }
                    event = registry_rx.recv() => {
                        if let Ok(RegistryEvent::Demoted { plugin_id }) = event {
                            orchestrator.on_plugin_demoted(&plugin_id).await;
                        }
                    }
                }
            }
            info!("Orchestrator control loop stopped");
        })
    }

    /// Service one capability gap request.
    async fn service_gap(&self, requirement: SynthesisRequirement) {
        // Already resolvable: nothing to synthesize, just unblock.
        if !self
            .registry
            .resolve(&requirement.capability, &VersionConstraint::any())
            .await
            .is_empty()
        {
            self.scheduler
                .unblock_task_type(&requirement.capability)
                .await;
            return;
        }

        // Skip duplicates already being serviced.
        let signature = requirement.signature();
        {
            let gaps = self.gaps.read().await;
            if gaps
                .iter()
                .any(|g| !g.status.is_terminal() && g.requirement.signature() == signature)
            {
                return;
            }
        }

        let mut gap = CapabilityGap::new(requirement);
        let gap_id = gap.id;
        self.gaps.write().await.push(gap.clone());

        let capability = gap.requirement.capability.clone();
        let outcome = self.synthesizer.process_gap(&mut gap).await;

        // Record the terminal gap state.
        {
            let mut gaps = self.gaps.write().await;
            if let Some(stored) = gaps.iter_mut().find(|g| g.id == gap_id) {
                *stored = gap;
            }
        }

        match outcome {
            Ok(plugin_id) => {
                info!(capability = %capability, plugin_id = %plugin_id, "Capability gap closed");
                let unblocked = self.scheduler.unblock_task_type(&capability).await;
                if unblocked > 0 {
                    info!(count = unblocked, "Blocked tasks released after synthesis");
                }
            }
            Err(err) => {
                warn!(capability = %capability, error = %err, "Capability gap failed");
            }
        }
    }

    async fn on_scheduler_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::AttemptFinished {
                goal_id,
                task_id,
                attempt,
            } => {
                if let Err(e) =
                    storage::append_goal_history(&self.data_dir, goal_id, task_id, &attempt)
                {
                    warn!(goal_id = %goal_id, error = %e, "History append failed");
                }
            }
            SchedulerEvent::GoalFinished { goal_id, status } => {
                info!(goal_id = %goal_id, status = status.as_str(), "Releasing goal fleet");
                let fleet = self.manager.fleet().await;
                for agent in fleet
                    .iter()
                    .filter(|a| a.goal_id == goal_id && !a.status.is_terminal())
                {
                    self.manager.terminate(agent.id).await;
                }
            }
            SchedulerEvent::TaskTransition { .. } => {}
        }
    }

    /// Demoted plugins lose their in-flight tasks to reassignment.
    async fn on_plugin_demoted(&self, plugin_id: &str) {
        let using = self.scheduler.tasks_using_plugin(plugin_id).await;
        for task_id in using {
            if let Some(task) = self.scheduler.get_task(task_id).await {
                if matches!(task.status, TaskStatus::Claimed | TaskStatus::Running) {
                    if let Err(e) = self.scheduler.release(task_id).await {
                        warn!(task_id = %task_id, error = %e, "Demotion release failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::Config;
    use crate::services::monitor::ResourceMonitor;
    use crate::services::sandbox::SandboxExecutor;

    fn orchestrator_fixture() -> (tempfile::TempDir, Arc<Orchestrator>) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::default();
        let data_dir = DataDir::open(tmp.path()).unwrap();
        let scheduler = Arc::new(TaskScheduler::new());
        let registry = Arc::new(PluginRegistry::new());
        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone(), &config.pools));
        let sandbox = Arc::new(SandboxExecutor::new(
            config.sandbox.clone(),
            Arc::clone(&registry),
            Arc::clone(&monitor),
        ));
        let synthesizer = Arc::new(
            PluginSynthesizer::new(
                config.synthesis.clone(),
                Arc::clone(&registry),
                Arc::clone(&sandbox),
                data_dir.clone(),
            )
            .with_in_process_candidates(),
        );
        let (gap_tx, gap_rx) = mpsc::channel(64);
        let manager = Arc::new(AgentManager::new(
            config.agents.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&registry),
            Arc::clone(&sandbox),
            Arc::clone(&monitor),
            gap_tx.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            scheduler,
            registry,
            manager,
            synthesizer,
            monitor,
            data_dir,
            gap_tx,
            gap_rx,
        ));
        (tmp, orchestrator)
    }

    #[tokio::test]
    async fn test_submit_requires_confident_plan() {
        let (_tmp, orchestrator) = orchestrator_fixture();
        // The builtin planner always produces at least one task, so a
        // normal submission is accepted.
        let goal_id = orchestrator
            .submit("say hello".to_string(), 1, None, BTreeSet::new())
            .await
            .unwrap();
        let view = orchestrator.goal_view(goal_id).await.unwrap();
        assert_eq!(view.tasks.len(), 1);
        orchestrator.cancel(goal_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_tmp, orchestrator) = orchestrator_fixture();
        let goal_id = orchestrator
            .submit("cancel me".to_string(), 1, None, BTreeSet::new())
            .await
            .unwrap();
        orchestrator.cancel(goal_id).await.unwrap();
        orchestrator.cancel(goal_id).await.unwrap();

        let view = orchestrator.goal_view(goal_id).await.unwrap();
        assert_eq!(view.goal.status, GoalStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_goal_rejected() {
        let (_tmp, orchestrator) = orchestrator_fixture();
        let err = orchestrator.goal_view(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::GoalNotFound(_)));
    }

    #[tokio::test]
    async fn test_uptime_report() {
        let (_tmp, orchestrator) = orchestrator_fixture();
        orchestrator.mark_initialized();
        let report = orchestrator.uptime().await;
        assert_eq!(report.status, "running");
        assert!(report.uptime_seconds >= 0);
        assert!(report.metrics.contains_key("goals_total"));
    }
}
