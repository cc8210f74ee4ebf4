//! Agent manager: spawn/terminate role-typed workers, heartbeats, and
//! failure recovery.
//!
//! Workers are cooperative tasks that poll the scheduler for claimable
//! work, route it through the registry and sandbox, and report outcomes.
//! Role policy is enforced at claim time; a worker never invokes a plugin
//! its role does not allow.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::agent::{Agent, AgentRole, AgentStatus, RolePolicy};
use crate::domain::models::capability::{SynthesisRequirement, SynthesisTestCase};
use crate::domain::models::config::AgentConfig;
use crate::domain::models::goal::{Decomposition, Goal};
use crate::domain::models::plugin::VersionConstraint;
use crate::domain::models::resource::ResourceQuota;
use crate::domain::ports::Caller;
use crate::services::monitor::{MonitorEvent, PoolAllocation, ResourceMonitor};
use crate::services::planner::BuiltinPlanner;
use crate::services::registry::PluginRegistry;
use crate::services::sandbox::SandboxExecutor;
use crate::services::scheduler::TaskScheduler;

/// How often idle workers poll for claimable work.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Events broadcast by the manager.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Spawned { agent_id: Uuid, role: AgentRole },
    Terminated { agent_id: Uuid },
    Failed { agent_id: Uuid, reason: String },
    RoleDisabled { role: AgentRole },
}

#[derive(Debug, Default)]
struct RoleHealth {
    consecutive_failures: u32,
    disabled: bool,
}

struct WorkerHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
    /// Pool shares held for the agent's quota; released on drop
    _allocations: Vec<PoolAllocation>,
}

#[derive(Default)]
struct ManagerState {
    agents: HashMap<Uuid, Agent>,
    policies: HashMap<AgentRole, RolePolicy>,
    health: HashMap<AgentRole, RoleHealth>,
}

/// Spawns and supervises the worker fleet.
pub struct AgentManager {
    config: AgentConfig,
    scheduler: Arc<TaskScheduler>,
    registry: Arc<PluginRegistry>,
    sandbox: Arc<SandboxExecutor>,
    monitor: Arc<ResourceMonitor>,
    state: RwLock<ManagerState>,
    workers: Mutex<HashMap<Uuid, WorkerHandle>>,
    planner: BuiltinPlanner,
    /// Capability gaps flow to the orchestrator over this bounded channel
    gap_tx: mpsc::Sender<SynthesisRequirement>,
    event_tx: broadcast::Sender<AgentEvent>,
}

impl AgentManager {
    pub fn new(
        config: AgentConfig,
        scheduler: Arc<TaskScheduler>,
        registry: Arc<PluginRegistry>,
        sandbox: Arc<SandboxExecutor>,
        monitor: Arc<ResourceMonitor>,
        gap_tx: mpsc::Sender<SynthesisRequirement>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let mut state = ManagerState::default();
        for role in AgentRole::all() {
            state.policies.insert(*role, RolePolicy::builtin(*role));
            state.health.insert(*role, RoleHealth::default());
        }
        Self {
            config,
            scheduler,
            registry,
            sandbox,
            monitor,
            state: RwLock::new(state),
            workers: Mutex::new(HashMap::new()),
            planner: BuiltinPlanner::new(),
            gap_tx,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// Replace the policy for a role (operator configuration).
    pub async fn set_policy(&self, policy: RolePolicy) {
        let mut state = self.state.write().await;
        state.policies.insert(policy.role, policy);
    }

    // ------------------------------------------------------------------
    // Spawn / terminate
    // ------------------------------------------------------------------

    /// Spawn a worker bound to a role, goal, and quota.
    #[instrument(skip(self, skills, quota), fields(role = %role, goal_id = %goal_id), err)]
    pub async fn spawn(
        self: &Arc<Self>,
        role: AgentRole,
        skills: BTreeSet<String>,
        goal_id: Uuid,
        quota: ResourceQuota,
    ) -> RuntimeResult<Uuid> {
        let policy = {
            let state = self.state.read().await;
            let health = state.health.get(&role);
            if health.is_some_and(|h| h.disabled) {
                return Err(RuntimeError::RoleDisabled(role.as_str().to_string()));
            }
            let active = state
                .agents
                .values()
                .filter(|a| !a.status.is_terminal())
                .count();
            if active >= self.config.max_agents {
                return Err(RuntimeError::InsufficientResources(format!(
                    "Fleet is at its limit of {} agents",
                    self.config.max_agents
                )));
            }
            let policy = state
                .policies
                .get(&role)
                .cloned()
                .unwrap_or_else(|| RolePolicy::builtin(role));
            if !policy.required_capabilities.is_subset(&skills) {
                let missing: Vec<&String> = policy
                    .required_capabilities
                    .difference(&skills)
                    .collect();
                return Err(RuntimeError::ValidationFailed(format!(
                    "Role {role} requires capabilities {missing:?}"
                )));
            }
            policy
        };

        // Resource binding: take the agent's shares out of the pools up
        // front; the guards release them when the worker is dropped.
        let mut wanted = BTreeMap::new();
        wanted.insert("cpu_percent".to_string(), quota.cpu_percent);
        wanted.insert("memory_mb".to_string(), quota.memory_mb as f64);
        if !self.monitor.can_allocate(&wanted) {
            return Err(RuntimeError::InsufficientResources(
                "Pools cannot cover the agent quota".to_string(),
            ));
        }
        let mut allocations = Vec::new();
        for (pool, amount) in &wanted {
            allocations.push(self.monitor.allocate(pool, *amount)?);
        }

        let agent = Agent::new(role, goal_id, skills).with_quota(quota);
        let agent_id = agent.id;
        self.monitor
            .register_owner(agent_id.to_string(), Some(quota), None)
            .await;

        {
            let mut state = self.state.write().await;
            state.agents.insert(agent_id, agent);
        }

        let cancel = CancellationToken::new();
        let join = tokio::spawn(worker_loop(
            Arc::clone(self),
            agent_id,
            goal_id,
            policy,
            cancel.clone(),
        ));
        self.workers.lock().await.insert(
            agent_id,
            WorkerHandle {
                cancel,
                join,
                _allocations: allocations,
            },
        );

        info!(agent_id = %agent_id, "Agent spawned");
        let _ = self.event_tx.send(AgentEvent::Spawned { agent_id, role });
        Ok(agent_id)
    }

    /// Best-effort graceful termination, forced after the grace period.
    pub async fn terminate(&self, agent_id: Uuid) -> bool {
        let Some(handle) = self.workers.lock().await.remove(&agent_id) else {
            return false;
        };
        handle.cancel.cancel();

        let grace = Duration::from_secs(self.config.grace_period_secs);
        let mut join = handle.join;
        if tokio::time::timeout(grace, &mut join).await.is_err() {
            warn!(agent_id = %agent_id, "Agent ignored graceful stop, aborting");
            join.abort();
        }

        self.monitor.unregister_owner(&agent_id.to_string()).await;
        {
            let mut state = self.state.write().await;
            let role = state.agents.get_mut(&agent_id).map(|agent| {
                agent.status = AgentStatus::Terminated;
                agent.role
            });
            // Clean exits reset the role failure streak.
            if let Some(role) = role {
                if let Some(health) = state.health.get_mut(&role) {
                    health.consecutive_failures = 0;
                }
            }
        }
        let _ = self.event_tx.send(AgentEvent::Terminated { agent_id });
        true
    }

    /// Record a heartbeat from a worker.
    pub async fn heartbeat(&self, agent_id: Uuid) {
        let mut state = self.state.write().await;
        if let Some(agent) = state.agents.get_mut(&agent_id) {
            agent.beat();
        }
    }

    pub async fn status(&self, agent_id: Uuid) -> Option<Agent> {
        self.state.read().await.agents.get(&agent_id).cloned()
    }

    /// Route a specific task to a specific agent by claiming on its
    /// behalf; the worker finds the claim on its next cycle.
    pub async fn route_task(&self, agent_id: Uuid, task_id: Uuid) -> RuntimeResult<()> {
        {
            let state = self.state.read().await;
            let agent = state
                .agents
                .get(&agent_id)
                .ok_or(RuntimeError::AgentNotFound(agent_id))?;
            if agent.status.is_terminal() {
                return Err(RuntimeError::AgentNotFound(agent_id));
            }
        }
        self.scheduler.claim(task_id, agent_id).await
    }

    /// Fleet snapshot, newest first.
    pub async fn fleet(&self) -> Vec<Agent> {
        let state = self.state.read().await;
        let mut agents: Vec<Agent> = state.agents.values().cloned().collect();
        agents.sort_by(|a, b| b.spawned_at.cmp(&a.spawned_at));
        agents
    }

    /// Restore fleet records from a snapshot. Restored workers are gone;
    /// their records are kept as history, marked terminated.
    pub async fn restore(&self, mut agents: Vec<Agent>) {
        let mut state = self.state.write().await;
        for agent in &mut agents {
            if !agent.status.is_terminal() {
                agent.status = AgentStatus::Terminated;
            }
            state.agents.insert(agent.id, agent.clone());
        }
    }

    /// Re-enable a role disabled by repeated failures (operator action).
    pub async fn enable_role(&self, role: AgentRole) {
        let mut state = self.state.write().await;
        if let Some(health) = state.health.get_mut(&role) {
            health.disabled = false;
            health.consecutive_failures = 0;
        }
    }

    /// Whether a role is currently disabled.
    pub async fn role_disabled(&self, role: AgentRole) -> bool {
        let state = self.state.read().await;
        state.health.get(&role).is_some_and(|h| h.disabled)
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    /// Ask the planner role for a decomposition. A transient planner
    /// agent is recorded in the fleet for the duration of the call.
    pub async fn plan(&self, goal: &Goal) -> RuntimeResult<Decomposition> {
        if self.role_disabled(AgentRole::Planner).await {
            return Err(RuntimeError::RoleDisabled(
                AgentRole::Planner.as_str().to_string(),
            ));
        }
        let mut planner_agent = Agent::new(
            AgentRole::Planner,
            goal.id,
            ["planning".to_string()].into_iter().collect(),
        );
        planner_agent.status = AgentStatus::Busy;
        let planner_id = planner_agent.id;
        {
            let mut state = self.state.write().await;
            state.agents.insert(planner_id, planner_agent);
        }

        let decomposition = self.planner.decompose(goal);

        {
            let mut state = self.state.write().await;
            if let Some(agent) = state.agents.get_mut(&planner_id) {
                agent.status = AgentStatus::Terminated;
            }
        }
        Ok(decomposition)
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Start the background maintenance loop: stale-heartbeat detection
    /// and quota-violation recovery.
    pub fn start_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            let mut monitor_rx = manager.monitor.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        manager.recover_stale_agents().await;
                    }
                    event = monitor_rx.recv() => {
                        if let Ok(MonitorEvent::QuotaExceeded { owner, axis }) = event {
                            if let Ok(agent_id) = Uuid::parse_str(&owner) {
                                manager
                                    .recover(agent_id, format!("quota exceeded on {axis}"))
                                    .await;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn recover_stale_agents(&self) {
        let tolerance = self.monitor.interval() * self.config.stale_after_factor as i32;
        let now = Utc::now();
        let stale: Vec<Uuid> = {
            let state = self.state.read().await;
            state
                .agents
                .values()
                .filter(|a| !a.status.is_terminal())
                .filter(|a| a.is_stale(tolerance, now))
                .map(|a| a.id)
                .collect()
        };
        for agent_id in stale {
            self.recover(agent_id, "missed heartbeats".to_string()).await;
        }
    }

    /// Recovery sequence: reassign tasks, graceful stop, forced stop,
    /// record the failure, disable the role after repeated failures.
    pub async fn recover(&self, agent_id: Uuid, reason: String) {
        let role = {
            let state = self.state.read().await;
            match state.agents.get(&agent_id) {
                Some(agent) if !agent.status.is_terminal() => agent.role,
                _ => return,
            }
        };
        warn!(agent_id = %agent_id, reason = %reason, "Recovering failed agent");

        // 1. Hand its tasks back to the scheduler.
        let released = self.scheduler.release_tasks_of(agent_id).await;
        if !released.is_empty() {
            info!(agent_id = %agent_id, count = released.len(), "Tasks released for reassignment");
        }

        // 2-3. Graceful stop, then forced.
        if let Some(handle) = self.workers.lock().await.remove(&agent_id) {
            handle.cancel.cancel();
            let grace = Duration::from_secs(self.config.grace_period_secs);
            let mut join = handle.join;
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                warn!(agent_id = %agent_id, "Forced agent termination");
                join.abort();
            }
        }
        self.monitor.unregister_owner(&agent_id.to_string()).await;

        // 4. Record the failure; repeated failures disable the role.
        let disabled = {
            let mut state = self.state.write().await;
            if let Some(agent) = state.agents.get_mut(&agent_id) {
                agent.status = AgentStatus::Failed;
                agent.consecutive_failures += 1;
            }
            let health = state.health.entry(role).or_default();
            health.consecutive_failures += 1;
            if health.consecutive_failures >= self.config.role_failure_threshold {
                health.disabled = true;
                true
            } else {
                false
            }
        };

        let _ = self.event_tx.send(AgentEvent::Failed {
            agent_id,
            reason,
        });
        if disabled {
            warn!(role = %role, "Role disabled after repeated failures");
            let _ = self.event_tx.send(AgentEvent::RoleDisabled { role });
        }
    }

    // ------------------------------------------------------------------
    // Worker internals
    // ------------------------------------------------------------------

    /// One work cycle for an agent: find a claim, resolve a plugin, run
    /// it, report the outcome.
    async fn work_once(
        self: &Arc<Self>,
        agent_id: Uuid,
        goal_id: Uuid,
        policy: &RolePolicy,
        cancel: &CancellationToken,
    ) {
        // Routed claims take precedence over fresh polls.
        let claimed = self.find_routed_claim(agent_id).await;
        let task_id = match claimed {
            Some(task_id) => Some(task_id),
            None => self.try_claim_next(agent_id, goal_id, policy).await,
        };
        let Some(task_id) = task_id else {
            return;
        };

        {
            let mut state = self.state.write().await;
            if let Some(agent) = state.agents.get_mut(&agent_id) {
                agent.take_task(task_id);
            }
        }
        self.execute_claimed(agent_id, task_id, policy, cancel).await;
        {
            let mut state = self.state.write().await;
            if let Some(agent) = state.agents.get_mut(&agent_id) {
                agent.drop_task(task_id);
            }
        }
    }

    async fn find_routed_claim(&self, agent_id: Uuid) -> Option<Uuid> {
        let goal_id = self.state.read().await.agents.get(&agent_id)?.goal_id;
        self.scheduler
            .goal_tasks(goal_id)
            .await
            .into_iter()
            .find(|t| {
                t.claimed_by == Some(agent_id)
                    && t.status == crate::domain::models::task::TaskStatus::Claimed
            })
            .map(|t| t.id)
    }

    /// Resolve-then-claim so role violations are rejected before a claim
    /// is ever taken.
    async fn try_claim_next(
        self: &Arc<Self>,
        agent_id: Uuid,
        goal_id: Uuid,
        policy: &RolePolicy,
    ) -> Option<Uuid> {
        let claimable = self.scheduler.claimable_tasks(goal_id, i32::MIN).await;
        for task_id in claimable {
            let task = self.scheduler.get_task(task_id).await?;
            let candidates = self
                .registry
                .resolve(&task.task_type, &VersionConstraint::any())
                .await;

            if candidates.is_empty() {
                // Capability gap: claim so nobody else spins on it, block
                // it, and hand the requirement to the synthesizer.
                if self.scheduler.claim(task_id, agent_id).await.is_ok() {
                    let reason = format!("No plugin provides capability {}", task.task_type);
                    let _ = self.scheduler.block(task_id, reason).await;
                    self.report_gap(&task).await;
                }
                continue;
            }

            if !candidates
                .iter()
                .any(|c| policy.allows_plugin(&c.plugin_id))
            {
                // Role not allowed to run any candidate; leave the task
                // for an agent that is.
                debug!(task_id = %task_id, "Role policy rejects all candidate plugins");
                continue;
            }

            match self.scheduler.claim(task_id, agent_id).await {
                Ok(()) => return Some(task_id),
                Err(RuntimeError::AlreadyClaimed(_)) => continue,
                Err(e) => {
                    debug!(task_id = %task_id, error = %e, "Claim refused");
                    continue;
                }
            }
        }
        None
    }

    async fn execute_claimed(
        self: &Arc<Self>,
        agent_id: Uuid,
        task_id: Uuid,
        policy: &RolePolicy,
        cancel: &CancellationToken,
    ) {
        let Some(task) = self.scheduler.get_task(task_id).await else {
            return;
        };

        // Re-resolve at execution time; the plugin may have been
        // unloaded since the claim.
        let candidates = self
            .registry
            .resolve(&task.task_type, &VersionConstraint::any())
            .await;
        let Some(choice) = candidates
            .iter()
            .find(|c| policy.allows_plugin(&c.plugin_id))
        else {
            let reason = format!("No runnable plugin for capability {}", task.task_type);
            let _ = self.scheduler.block(task_id, reason).await;
            self.report_gap(&task).await;
            return;
        };
        let plugin_id = choice.plugin_id.clone();

        if let Err(e) = self
            .scheduler
            .start(task_id, Some(plugin_id.clone()))
            .await
        {
            warn!(task_id = %task_id, error = %e, "Could not start claimed task");
            return;
        }

        let input = task
            .config
            .get("input")
            .cloned()
            .unwrap_or_else(|| task.config.clone());
        let timeout = Duration::from_secs(task.timeout_secs);

        let outcome = self
            .sandbox
            .execute(&plugin_id, input, timeout, Caller::Agent(agent_id), cancel.child_token())
            .await;

        match outcome {
            Ok(run) => {
                self.registry
                    .update_score(&plugin_id, true, run.duration_ms)
                    .await;
                let outputs = outputs_from(run.output);
                if let Err(e) = self
                    .scheduler
                    .complete(task_id, outputs, run.peaks)
                    .await
                {
                    warn!(task_id = %task_id, error = %e, "Completion rejected");
                }
            }
            Err(err) => {
                if !matches!(err, RuntimeError::CancelRequested) {
                    self.registry.update_score(&plugin_id, false, 0).await;
                }
                if let Err(e) = self.scheduler.fail(task_id, err).await {
                    warn!(task_id = %task_id, error = %e, "Failure report rejected");
                }
            }
        }
    }

    /// Build a synthesis requirement from a blocked task and queue it.
    async fn report_gap(&self, task: &crate::domain::models::task::Task) {
        let test_cases: Vec<SynthesisTestCase> = task
            .config
            .get("test_cases")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let mut requirement = SynthesisRequirement::new(
            task.task_type.clone(),
            format!("Capability {} required by task {}", task.task_type, task.id),
        );
        requirement.test_cases = test_cases;

        // Bounded channel: a full synthesis queue applies backpressure
        // to the reporting worker.
        if let Err(e) = self.gap_tx.send(requirement).await {
            warn!(error = %e, "Capability gap dropped, synthesis queue closed");
        }
    }
}

fn outputs_from(output: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
    match output {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        other => {
            let mut map = BTreeMap::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

/// The worker task: heartbeat on its cadence, poll for work, exit on
/// cancel.
async fn worker_loop(
    manager: Arc<AgentManager>,
    agent_id: Uuid,
    goal_id: Uuid,
    policy: RolePolicy,
    cancel: CancellationToken,
) {
    let mut heartbeat = interval(Duration::from_secs(
        manager.config.heartbeat_secs.max(1),
    ));
    let mut poll = interval(POLL_INTERVAL);
    debug!(agent_id = %agent_id, "Worker loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => {
                manager.heartbeat(agent_id).await;
            }
            _ = poll.tick() => {
                manager.work_once(agent_id, goal_id, &policy, &cancel).await;
            }
        }
    }
    debug!(agent_id = %agent_id, "Worker loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::{MonitorConfig, SandboxConfig};
    use crate::domain::models::goal::TaskDescriptor;
    use crate::domain::models::plugin::PluginMetadata;
    use crate::domain::ports::PluginHandle;
    use crate::services::transform::{TransformPlugin, TransformSpec};
    use semver::Version;
    use serde_json::json;

    struct Fixture {
        scheduler: Arc<TaskScheduler>,
        registry: Arc<PluginRegistry>,
        manager: Arc<AgentManager>,
        gap_rx: mpsc::Receiver<SynthesisRequirement>,
    }

    fn fixture() -> Fixture {
        let mut pool_caps = BTreeMap::new();
        pool_caps.insert("cpu_percent".to_string(), 400.0);
        pool_caps.insert("memory_mb".to_string(), 4096.0);

        let scheduler = Arc::new(TaskScheduler::new());
        let registry = Arc::new(PluginRegistry::new());
        let monitor = Arc::new(ResourceMonitor::new(MonitorConfig::default(), &pool_caps));
        let sandbox = Arc::new(SandboxExecutor::new(
            SandboxConfig::default(),
            Arc::clone(&registry),
            Arc::clone(&monitor),
        ));
        let (gap_tx, gap_rx) = mpsc::channel(8);
        let manager = Arc::new(AgentManager::new(
            AgentConfig::default(),
            Arc::clone(&scheduler),
            Arc::clone(&registry),
            sandbox,
            monitor,
            gap_tx,
        ));
        Fixture {
            scheduler,
            registry,
            manager,
            gap_rx,
        }
    }

    async fn register_doubler(registry: &PluginRegistry) -> String {
        let metadata = PluginMetadata::new("doubler", Version::new(1, 0, 0))
            .with_capability("double")
            .with_trusted(true);
        registry
            .register(
                metadata,
                PluginHandle::Native(Arc::new(TransformPlugin::new(TransformSpec::Affine {
                    a: 2.0,
                    b: 0.0,
                }))),
            )
            .await
            .unwrap()
    }

    async fn one_task_goal(scheduler: &TaskScheduler, task_type: &str, input: serde_json::Value) -> (Uuid, Uuid) {
        let goal = Goal::new("test goal", 5);
        let goal_id = goal.id;
        let descriptor = TaskDescriptor::new(task_type).with_config(json!({ "input": input }));
        let task_id = descriptor.id;
        scheduler
            .register_goal(
                goal,
                Decomposition {
                    tasks: vec![descriptor],
                    ..Decomposition::default()
                },
            )
            .await
            .unwrap();
        (goal_id, task_id)
    }

    #[tokio::test]
    async fn test_spawn_and_execute_to_completion() {
        let fixture = fixture();
        register_doubler(&fixture.registry).await;
        let (goal_id, task_id) = one_task_goal(&fixture.scheduler, "double", json!(21)).await;

        let agent_id = fixture
            .manager
            .spawn(
                AgentRole::Executor,
                BTreeSet::new(),
                goal_id,
                ResourceQuota::default(),
            )
            .await
            .unwrap();

        // Let the worker claim, run, and complete.
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let task = fixture.scheduler.get_task(task_id).await.unwrap();
            if task.is_terminal() {
                break;
            }
        }

        let task = fixture.scheduler.get_task(task_id).await.unwrap();
        assert_eq!(task.status, crate::domain::models::task::TaskStatus::Completed);
        let attempt = task.attempts.last().unwrap();
        assert_eq!(attempt.outputs.get("result"), Some(&json!(42)));
        assert_eq!(attempt.plugin_id.as_deref(), Some("doubler@1.0.0"));

        assert!(fixture.manager.terminate(agent_id).await);
        let agent = fixture.manager.status(agent_id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
    }

    #[tokio::test]
    async fn test_capability_gap_reported_and_task_blocked() {
        let mut fixture = fixture();
        let (goal_id, task_id) =
            one_task_goal(&fixture.scheduler, "c_new", json!(1)).await;

        let _agent = fixture
            .manager
            .spawn(
                AgentRole::Executor,
                BTreeSet::new(),
                goal_id,
                ResourceQuota::default(),
            )
            .await
            .unwrap();

        let requirement = tokio::time::timeout(Duration::from_secs(5), fixture.gap_rx.recv())
            .await
            .expect("gap reported")
            .expect("channel open");
        assert_eq!(requirement.capability, "c_new");

        let task = fixture.scheduler.get_task(task_id).await.unwrap();
        assert_eq!(task.status, crate::domain::models::task::TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn test_spawn_rejects_missing_role_capabilities() {
        let fixture = fixture();
        let err = fixture
            .manager
            .spawn(
                AgentRole::Tester,
                BTreeSet::new(), // testers must declare "testing"
                Uuid::new_v4(),
                ResourceQuota::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_spawn_rejects_oversized_quota() {
        let fixture = fixture();
        let quota = ResourceQuota {
            memory_mb: 1_000_000,
            ..ResourceQuota::default()
        };
        let err = fixture
            .manager
            .spawn(AgentRole::Executor, BTreeSet::new(), Uuid::new_v4(), quota)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InsufficientResources(_)));
    }

    #[tokio::test]
    async fn test_role_disabled_after_repeated_failures() {
        let fixture = fixture();
        let goal_id = Uuid::new_v4();

        for _ in 0..3 {
            let agent_id = fixture
                .manager
                .spawn(
                    AgentRole::Executor,
                    BTreeSet::new(),
                    goal_id,
                    ResourceQuota::default(),
                )
                .await
                .unwrap();
            fixture
                .manager
                .recover(agent_id, "test-induced failure".to_string())
                .await;
        }

        assert!(fixture.manager.role_disabled(AgentRole::Executor).await);
        let err = fixture
            .manager
            .spawn(
                AgentRole::Executor,
                BTreeSet::new(),
                goal_id,
                ResourceQuota::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::RoleDisabled(_)));

        // Operator intervention re-enables the role.
        fixture.manager.enable_role(AgentRole::Executor).await;
        assert!(!fixture.manager.role_disabled(AgentRole::Executor).await);
    }

    struct Napper;

    #[async_trait::async_trait]
    impl crate::domain::ports::Plugin for Napper {
        async fn execute(
            &self,
            input: serde_json::Value,
            ctx: &crate::domain::ports::ExecutionContext,
        ) -> RuntimeResult<serde_json::Value> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(input),
                _ = ctx.cancel.cancelled() => Err(RuntimeError::CancelRequested),
            }
        }
    }

    #[tokio::test]
    async fn test_recovery_releases_tasks_for_reassignment() {
        let fixture = fixture();
        // A plugin slow enough that the task is mid-flight at recovery.
        let metadata = PluginMetadata::new("napper", Version::new(1, 0, 0))
            .with_capability("nap")
            .with_trusted(true);
        fixture
            .registry
            .register(metadata, PluginHandle::Native(Arc::new(Napper)))
            .await
            .unwrap();
        let (goal_id, task_id) = one_task_goal(&fixture.scheduler, "nap", json!(3)).await;

        let agent_id = fixture
            .manager
            .spawn(
                AgentRole::Executor,
                BTreeSet::new(),
                goal_id,
                ResourceQuota::default(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        fixture.manager.recover(agent_id, "stale".to_string()).await;

        let task = fixture.scheduler.get_task(task_id).await.unwrap();
        assert_eq!(task.status, crate::domain::models::task::TaskStatus::Pending);

        let agent = fixture.manager.status(agent_id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Failed);
    }

    #[tokio::test]
    async fn test_plan_records_transient_planner() {
        let fixture = fixture();
        let goal = Goal::new("do the thing", 1).with_capability("double");
        let decomposition = fixture.manager.plan(&goal).await.unwrap();
        assert_eq!(decomposition.tasks.len(), 1);

        let fleet = fixture.manager.fleet().await;
        assert!(fleet
            .iter()
            .any(|a| a.role == AgentRole::Planner && a.status == AgentStatus::Terminated));
    }
}
