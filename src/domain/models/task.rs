//! Task domain model.
//!
//! Tasks are the atomic work units of a goal's decomposition. They form a
//! DAG with dependencies and carry an append-only attempt history.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::errors::{ErrorReport, RuntimeError, RuntimeResult};

/// Default number of retries before a task stays failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-task execution timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;

/// Retry backoff base, factor, and cap (seconds).
pub const BACKOFF_BASE_SECS: u64 = 1;
pub const BACKOFF_FACTOR: u64 = 2;
pub const BACKOFF_CAP_SECS: u64 = 60;

/// Status of a task in the scheduling pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Defined; may or may not have unmet dependencies
    Pending,
    /// Claimed by exactly one agent, not yet started
    Claimed,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully after exhausting retries
    Failed,
    /// Released back by an agent or the recovery path
    Released,
    /// Exceeded its execution deadline
    Timeout,
    /// Dependencies unmet or a dependency failed
    Blocked,
    /// Cancelled by a goal-level cascade
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Released => "released",
            Self::Timeout => "timeout",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "released" => Some(Self::Released),
            "timeout" => Some(Self::Timeout),
            "blocked" => Some(Self::Blocked),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Claimed, Self::Blocked, Self::Cancelled],
            Self::Claimed => &[
                Self::Running,
                Self::Released,
                Self::Pending,
                Self::Blocked,
                Self::Cancelled,
            ],
            Self::Running => &[
                Self::Completed,
                Self::Failed,
                Self::Timeout,
                Self::Released,
                Self::Cancelled,
            ],
            Self::Timeout => &[Self::Pending, Self::Failed],
            Self::Released => &[Self::Pending, Self::Failed, Self::Cancelled],
            Self::Blocked => &[Self::Pending, Self::Cancelled],
            Self::Failed => &[Self::Pending],
            Self::Completed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// One terminal run of a task. The attempt list is append-only; the
/// scheduler never rewrites an old attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// Monotonic per-task version, starting at 1
    pub version: u32,
    /// When execution started
    pub started_at: DateTime<Utc>,
    /// When the attempt reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal status of this run
    pub status: TaskStatus,
    /// Error recorded on failure
    pub error: Option<ErrorReport>,
    /// Wall-clock execution time in milliseconds
    pub execution_ms: Option<u64>,
    /// Peak resource usage attributed to this run
    pub resource_peaks: BTreeMap<String, f64>,
    /// Plugin that ran this attempt, as `name@version`
    pub plugin_id: Option<String>,
    /// Structured outputs from the plugin
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl Attempt {
    pub fn open(version: u32) -> Self {
        Self {
            version,
            started_at: Utc::now(),
            completed_at: None,
            status: TaskStatus::Running,
            error: None,
            execution_ms: None,
            resource_peaks: BTreeMap::new(),
            plugin_id: None,
            outputs: BTreeMap::new(),
        }
    }

    /// Close the attempt with a terminal status.
    pub fn close(&mut self, status: TaskStatus, error: Option<ErrorReport>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
        self.execution_ms = Some(
            (now - self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
    }
}

/// A discrete unit of work within a goal's decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// Owning goal
    pub goal_id: Uuid,
    /// Type tag; doubles as the capability the task requires
    pub task_type: String,
    /// Opaque configuration consumed by the plugin
    pub config: serde_json::Value,
    /// Task ids this depends on
    pub depends_on: Vec<Uuid>,
    /// Current status
    pub status: TaskStatus,
    /// Priority, inherited from the goal unless overridden (higher first)
    pub priority: i32,
    /// Agent currently holding the claim
    pub claimed_by: Option<Uuid>,
    /// When the claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    /// When execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Retries consumed so far
    pub retry_count: u32,
    /// Maximum retries
    pub max_retries: u32,
    /// Execution timeout in seconds
    pub timeout_secs: u64,
    /// Do not hand out before this instant (retry backoff)
    pub not_before: Option<DateTime<Utc>>,
    /// Whether failure of this task fails the goal
    pub critical: bool,
    /// Predicates a terminal attempt must satisfy for goal completion
    #[serde(default)]
    pub success_criteria: Vec<crate::domain::models::goal::SuccessCriterion>,
    /// Last error, free-form
    pub error: Option<ErrorReport>,
    /// Append-only attempt history, length bounded by `max_retries + 1`
    pub attempts: Vec<Attempt>,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When last updated
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task for a goal.
    pub fn new(goal_id: Uuid, task_type: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal_id,
            task_type: task_type.into(),
            config: serde_json::Value::Null,
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            priority,
            claimed_by: None,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            not_before: None,
            critical: true,
            success_criteria: Vec::new(),
            error: None,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a dependency, ignoring self-references and duplicates.
    pub fn with_dependency(mut self, task_id: Uuid) -> Self {
        if !self.depends_on.contains(&task_id) && task_id != self.id {
            self.depends_on.push(task_id);
        }
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_dependencies(&self) -> bool {
        !self.depends_on.is_empty()
    }

    /// Whether another retry is permitted.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Exponential backoff delay for the next retry.
    pub fn retry_backoff(&self) -> Duration {
        let exp = BACKOFF_FACTOR.saturating_pow(self.retry_count);
        let secs = BACKOFF_BASE_SECS
            .saturating_mul(exp)
            .min(BACKOFF_CAP_SECS);
        Duration::seconds(secs as i64)
    }

    /// Whether the running task has exceeded its deadline.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (TaskStatus::Running, Some(started)) => {
                now - started > Duration::seconds(self.timeout_secs as i64)
            }
            _ => false,
        }
    }

    /// Transition to a new status, maintaining claim and timestamp
    /// invariants. All scheduler mutations go through here.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> RuntimeResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(RuntimeError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }
        self.apply_status(new_status);
        Ok(())
    }

    /// Force a status, bypassing the state machine. Reserved for snapshot
    /// restore reconciliation; every call is visible in logs.
    pub fn force_status(&mut self, new_status: TaskStatus, reason: &str) {
        tracing::warn!(
            task_id = %self.id,
            from = %self.status.as_str(),
            to = %new_status.as_str(),
            reason,
            "Forcing task status transition"
        );
        self.apply_status(new_status);
    }

    fn apply_status(&mut self, new_status: TaskStatus) {
        let now = Utc::now();
        self.status = new_status;
        self.updated_at = now;

        match new_status {
            TaskStatus::Running => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            // A retry run gets fresh terminal timestamps.
            TaskStatus::Pending => self.completed_at = None,
            _ => {}
        }

        // A claim is held only while claimed or running.
        if !matches!(new_status, TaskStatus::Claimed | TaskStatus::Running) {
            self.claimed_by = None;
            self.claimed_at = None;
        }
    }

    /// Open an attempt for the run that just started. Attempt versions are
    /// strictly monotonic per task.
    pub fn open_attempt(&mut self, plugin_id: Option<String>) -> u32 {
        let version = self.attempts.last().map(|a| a.version).unwrap_or(0) + 1;
        let mut attempt = Attempt::open(version);
        attempt.plugin_id = plugin_id;
        self.attempts.push(attempt);
        version
    }

    /// Close the most recent open attempt.
    pub fn close_attempt(&mut self, status: TaskStatus, error: Option<ErrorReport>) {
        if let Some(attempt) = self
            .attempts
            .iter_mut()
            .rev()
            .find(|a| a.completed_at.is_none())
        {
            attempt.close(status, error);
        }
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.task_type.trim().is_empty() {
            return Err(RuntimeError::ValidationFailed(
                "Task type cannot be empty".to_string(),
            ));
        }
        if self.depends_on.contains(&self.id) {
            return Err(RuntimeError::ValidationFailed(
                "Task cannot depend on itself".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task() -> Task {
        Task::new(Uuid::new_v4(), "transform", 5)
    }

    #[test]
    fn test_claim_lifecycle_clears_ownership() {
        let mut task = test_task();
        let agent = Uuid::new_v4();

        task.transition_to(TaskStatus::Claimed).unwrap();
        task.claimed_by = Some(agent);
        task.claimed_at = Some(Utc::now());

        task.transition_to(TaskStatus::Running).unwrap();
        assert_eq!(task.claimed_by, Some(agent), "running keeps the claim");
        assert!(task.started_at.is_some());

        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.claimed_by.is_none(), "terminal clears the claim");
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut task = test_task();
        // Pending cannot jump straight to running or completed.
        assert!(task.transition_to(TaskStatus::Running).is_err());
        assert!(task.transition_to(TaskStatus::Completed).is_err());

        task.transition_to(TaskStatus::Claimed).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        task.transition_to(TaskStatus::Completed).unwrap();
        // Terminal states never transition again.
        assert!(task.transition_to(TaskStatus::Pending).is_err());
    }

    #[test]
    fn test_timeout_then_retry_path() {
        let mut task = test_task();
        task.transition_to(TaskStatus::Claimed).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        task.transition_to(TaskStatus::Timeout).unwrap();
        assert!(task.claimed_by.is_none());
        task.transition_to(TaskStatus::Pending).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_backoff_schedule() {
        let mut task = test_task();
        assert_eq!(task.retry_backoff(), Duration::seconds(1));
        task.retry_count = 1;
        assert_eq!(task.retry_backoff(), Duration::seconds(2));
        task.retry_count = 2;
        assert_eq!(task.retry_backoff(), Duration::seconds(4));
        task.retry_count = 10;
        assert_eq!(task.retry_backoff(), Duration::seconds(60), "capped");
    }

    #[test]
    fn test_attempt_versions_monotonic() {
        let mut task = test_task();
        let v1 = task.open_attempt(Some("doubler@1.0.0".into()));
        task.close_attempt(TaskStatus::Timeout, None);
        let v2 = task.open_attempt(Some("doubler@1.0.0".into()));
        task.close_attempt(TaskStatus::Completed, None);

        assert_eq!(v1, 1);
        assert_eq!(v2, 2);
        assert_eq!(task.attempts.len(), 2);
        assert_eq!(task.attempts[0].status, TaskStatus::Timeout);
        assert!(task.attempts[1].execution_ms.is_some());
    }

    #[test]
    fn test_close_attempt_never_rewrites_closed() {
        let mut task = test_task();
        task.open_attempt(None);
        task.close_attempt(TaskStatus::Failed, None);
        let first_end = task.attempts[0].completed_at;

        // A second close with no open attempt is a no-op.
        task.close_attempt(TaskStatus::Completed, None);
        assert_eq!(task.attempts[0].status, TaskStatus::Failed);
        assert_eq!(task.attempts[0].completed_at, first_end);
    }

    #[test]
    fn test_timed_out_detection() {
        let mut task = test_task().with_timeout_secs(1);
        task.transition_to(TaskStatus::Claimed).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        task.started_at = Some(Utc::now() - Duration::seconds(5));
        assert!(task.is_timed_out(Utc::now()));

        task.timeout_secs = 3600;
        assert!(!task.is_timed_out(Utc::now()));
    }

    #[test]
    fn test_validation() {
        let task = Task::new(Uuid::new_v4(), "", 0);
        assert!(task.validate().is_err());

        let mut task = test_task();
        let own_id = task.id;
        task.depends_on.push(own_id);
        assert!(task.validate().is_err());
    }
}
