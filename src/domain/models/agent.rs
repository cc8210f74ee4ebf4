//! Agent and role domain models.
//!
//! Agents are role-typed workers bound to a goal and a resource quota.
//! Roles carry the permission surface; the effective capability set of an
//! agent is the intersection of its role allowance and its declared skills.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::resource::ResourceQuota;

/// Role of a worker agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Decomposes goals into task graphs
    Planner,
    /// Executes tasks through plugins
    Executor,
    /// Produces minimal diffs for failing synthesis candidates
    Refiner,
    /// Runs candidate plugins against their test cases
    Tester,
    /// Oversees the fleet; may override plugin choices
    Supervisor,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Refiner => "refiner",
            Self::Tester => "tester",
            Self::Supervisor => "supervisor",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "planner" => Some(Self::Planner),
            "executor" => Some(Self::Executor),
            "refiner" => Some(Self::Refiner),
            "tester" => Some(Self::Tester),
            "supervisor" => Some(Self::Supervisor),
            _ => None,
        }
    }

    pub fn all() -> &'static [AgentRole] {
        &[
            Self::Planner,
            Self::Executor,
            Self::Refiner,
            Self::Tester,
            Self::Supervisor,
        ]
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission surface of a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePolicy {
    /// Role this policy applies to
    pub role: AgentRole,
    /// Retries the role grants its agents
    pub max_retries: u32,
    /// Goal types agents of this role may serve; `*` allows all
    pub allowed_goal_types: BTreeSet<String>,
    /// Plugin ids the role may invoke; `*` allows all
    pub allowed_plugins: BTreeSet<String>,
    /// Capabilities an agent must declare to be spawned with this role
    pub required_capabilities: BTreeSet<String>,
    /// Scheduling priority, lower = higher
    pub priority: u8,
    /// Whether agents of this role may spawn further agents
    pub can_spawn_agents: bool,
    /// Whether agents of this role may modify goals
    pub can_modify_goals: bool,
    /// Whether agents of this role may override plugin choices
    pub can_override_plugins: bool,
}

impl RolePolicy {
    /// Built-in policy for a role.
    pub fn builtin(role: AgentRole) -> Self {
        let any: BTreeSet<String> = ["*".to_string()].into_iter().collect();
        match role {
            AgentRole::Planner => Self {
                role,
                max_retries: 2,
                allowed_goal_types: any.clone(),
                allowed_plugins: any,
                required_capabilities: ["planning".to_string()].into_iter().collect(),
                priority: 0,
                can_spawn_agents: false,
                can_modify_goals: true,
                can_override_plugins: false,
            },
            AgentRole::Executor => Self {
                role,
                max_retries: 3,
                allowed_goal_types: any.clone(),
                allowed_plugins: any,
                required_capabilities: BTreeSet::new(),
                priority: 2,
                can_spawn_agents: false,
                can_modify_goals: false,
                can_override_plugins: false,
            },
            AgentRole::Refiner => Self {
                role,
                max_retries: 3,
                allowed_goal_types: any.clone(),
                allowed_plugins: any,
                required_capabilities: ["refinement".to_string()].into_iter().collect(),
                priority: 3,
                can_spawn_agents: false,
                can_modify_goals: false,
                can_override_plugins: false,
            },
            AgentRole::Tester => Self {
                role,
                max_retries: 2,
                allowed_goal_types: any.clone(),
                allowed_plugins: any,
                required_capabilities: ["testing".to_string()].into_iter().collect(),
                priority: 3,
                can_spawn_agents: false,
                can_modify_goals: false,
                can_override_plugins: false,
            },
            AgentRole::Supervisor => Self {
                role,
                max_retries: 1,
                allowed_goal_types: any.clone(),
                allowed_plugins: any,
                required_capabilities: BTreeSet::new(),
                priority: 1,
                can_spawn_agents: true,
                can_modify_goals: true,
                can_override_plugins: true,
            },
        }
    }

    /// Whether the role may invoke the given plugin. Enforced at claim
    /// time, not execute time.
    pub fn allows_plugin(&self, plugin_id: &str) -> bool {
        self.allowed_plugins.contains("*") || self.allowed_plugins.contains(plugin_id)
    }
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Failed,
    Terminated,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// A worker agent bound to a role, goal, and quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier
    pub id: Uuid,
    /// Role, fixed at spawn
    pub role: AgentRole,
    /// Goal this agent serves
    pub goal_id: Uuid,
    /// Effective capability set: role allowance intersected with declared skills
    pub capabilities: BTreeSet<String>,
    /// Resource quota registered with the monitor
    pub quota: ResourceQuota,
    /// Lifecycle status
    pub status: AgentStatus,
    /// Tasks currently held, bounded by `max_concurrent_tasks`
    pub current_tasks: BTreeSet<Uuid>,
    /// Concurrency bound (one task at a time by default)
    pub max_concurrent_tasks: usize,
    /// Last heartbeat received by the manager
    pub last_heartbeat: DateTime<Utc>,
    /// Consecutive recovery failures, feeds role-health tracking
    pub consecutive_failures: u32,
    /// When spawned
    pub spawned_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(role: AgentRole, goal_id: Uuid, capabilities: BTreeSet<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            role,
            goal_id,
            capabilities,
            quota: ResourceQuota::default(),
            status: AgentStatus::Idle,
            current_tasks: BTreeSet::new(),
            max_concurrent_tasks: 1,
            last_heartbeat: now,
            consecutive_failures: 0,
            spawned_at: now,
        }
    }

    pub fn with_quota(mut self, quota: ResourceQuota) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// Record a heartbeat.
    pub fn beat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// Whether the heartbeat is older than the given tolerance.
    pub fn is_stale(&self, tolerance: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > tolerance
    }

    /// Whether the agent can take another task.
    pub fn has_capacity(&self) -> bool {
        !self.status.is_terminal() && self.current_tasks.len() < self.max_concurrent_tasks
    }

    /// Track a newly claimed task.
    pub fn take_task(&mut self, task_id: Uuid) {
        self.current_tasks.insert(task_id);
        self.status = AgentStatus::Busy;
    }

    /// Drop a finished task.
    pub fn drop_task(&mut self, task_id: Uuid) {
        self.current_tasks.remove(&task_id);
        if self.current_tasks.is_empty() && self.status == AgentStatus::Busy {
            self.status = AgentStatus::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in AgentRole::all() {
            assert_eq!(AgentRole::parse_str(role.as_str()), Some(*role));
        }
        assert_eq!(AgentRole::parse_str("overseer"), None);
    }

    #[test]
    fn test_builtin_role_flags() {
        let tester = RolePolicy::builtin(AgentRole::Tester);
        assert!(!tester.can_modify_goals);
        assert!(!tester.can_override_plugins);

        let supervisor = RolePolicy::builtin(AgentRole::Supervisor);
        assert!(supervisor.can_override_plugins);
        assert!(supervisor.can_spawn_agents);
    }

    #[test]
    fn test_plugin_allowlist() {
        let mut policy = RolePolicy::builtin(AgentRole::Executor);
        assert!(policy.allows_plugin("anything@1.0.0"));

        policy.allowed_plugins = ["fetcher@1.0.0".to_string()].into_iter().collect();
        assert!(policy.allows_plugin("fetcher@1.0.0"));
        assert!(!policy.allows_plugin("other@1.0.0"));
    }

    #[test]
    fn test_capacity_and_task_tracking() {
        let mut agent = Agent::new(AgentRole::Executor, Uuid::new_v4(), BTreeSet::new());
        assert!(agent.has_capacity());

        let task = Uuid::new_v4();
        agent.take_task(task);
        assert_eq!(agent.status, AgentStatus::Busy);
        assert!(!agent.has_capacity(), "default concurrency is one");

        agent.drop_task(task);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.has_capacity());
    }

    #[test]
    fn test_staleness() {
        let mut agent = Agent::new(AgentRole::Executor, Uuid::new_v4(), BTreeSet::new());
        agent.last_heartbeat = Utc::now() - chrono::Duration::seconds(30);
        assert!(agent.is_stale(chrono::Duration::seconds(10), Utc::now()));
        assert!(!agent.is_stale(chrono::Duration::seconds(60), Utc::now()));
    }
}
