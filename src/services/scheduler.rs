//! Task scheduler: dependency-ordered claim/release of work units with
//! timeouts, retries, and reassignment.
//!
//! All state changes are linearized per task behind the scheduler's lock;
//! `claim` is the short critical section that resolves concurrent claims
//! to exactly one winner.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{ErrorReport, RuntimeError, RuntimeResult};
use crate::domain::models::goal::{Decomposition, Goal, GoalStatus};
use crate::domain::models::task::{Attempt, Task, TaskStatus};
use crate::services::dependency_resolver::DependencyResolver;

/// Events broadcast as tasks and goals change state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    TaskTransition {
        goal_id: Uuid,
        task_id: Uuid,
        status: TaskStatus,
    },
    /// A run reached a terminal status; carries the closed attempt
    AttemptFinished {
        goal_id: Uuid,
        task_id: Uuid,
        attempt: Attempt,
    },
    GoalFinished {
        goal_id: Uuid,
        status: GoalStatus,
    },
}

/// Per-goal progress summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalProgress {
    pub goal_id: Uuid,
    pub status: GoalStatus,
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
}

#[derive(Default)]
struct SchedulerState {
    goals: HashMap<Uuid, Goal>,
    tasks: HashMap<Uuid, Task>,
    goal_tasks: HashMap<Uuid, Vec<Uuid>>,
}

/// Dependency-ordered task scheduler.
pub struct TaskScheduler {
    state: RwLock<SchedulerState>,
    resolver: DependencyResolver,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(SchedulerState::default()),
            resolver: DependencyResolver::new(),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a goal and its decomposition, rejecting cyclic plans.
    #[instrument(skip(self, goal, decomposition), fields(goal_id = %goal.id), err)]
    pub async fn register_goal(
        &self,
        mut goal: Goal,
        decomposition: Decomposition,
    ) -> RuntimeResult<Vec<Uuid>> {
        goal.validate().map_err(RuntimeError::ValidationFailed)?;
        self.resolver.validate_decomposition(&decomposition)?;

        let goal_criteria = decomposition.success_criteria.clone();
        let mut tasks = Vec::with_capacity(decomposition.tasks.len());
        for descriptor in &decomposition.tasks {
            let mut task = Task::new(
                goal.id,
                descriptor.task_type.clone(),
                descriptor.priority.unwrap_or(goal.priority),
            )
            .with_config(descriptor.config.clone())
            .with_critical(descriptor.critical);
            task.id = descriptor.id;
            if let Some(timeout) = descriptor.timeout_secs {
                task.timeout_secs = timeout;
            }
            if let Some(retries) = descriptor.max_retries {
                task.max_retries = retries;
            }
            task.success_criteria = if descriptor.success_criteria.is_empty() {
                goal_criteria.clone()
            } else {
                descriptor.success_criteria.clone()
            };
            for dep in decomposition.deps_of(descriptor.id) {
                task.depends_on.push(dep);
            }
            task.validate()?;
            tasks.push(task);
        }

        let task_ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        goal.decomposition = Some(decomposition);
        goal.set_status(GoalStatus::Scheduled);

        let mut state = self.state.write().await;
        state.goal_tasks.insert(goal.id, task_ids.clone());
        for task in tasks {
            state.tasks.insert(task.id, task);
        }
        state.goals.insert(goal.id, goal);
        Ok(task_ids)
    }

    /// Add a dependency edge after registration.
    ///
    /// Accepted but inert when both tasks are already completed; rejected
    /// while the dependent is running; rejected when it would close a
    /// cycle.
    pub async fn add_dependency(&self, task_id: Uuid, depends_on: Uuid) -> RuntimeResult<()> {
        let mut state = self.state.write().await;
        if !state.tasks.contains_key(&depends_on) {
            return Err(RuntimeError::TaskNotFound(depends_on));
        }
        let dependent = state
            .tasks
            .get(&task_id)
            .ok_or(RuntimeError::TaskNotFound(task_id))?;
        if dependent.status == TaskStatus::Running {
            return Err(RuntimeError::ValidationFailed(
                "Cannot add a dependency to a running task".to_string(),
            ));
        }
        if task_id == depends_on {
            return Err(RuntimeError::DependencyCycle(task_id));
        }

        let mut candidate: Vec<Task> = state.tasks.values().cloned().collect();
        if let Some(task) = candidate.iter_mut().find(|t| t.id == task_id) {
            if !task.depends_on.contains(&depends_on) {
                task.depends_on.push(depends_on);
            }
        }
        if self.resolver.detect_cycle(&candidate).is_some() {
            return Err(RuntimeError::DependencyCycle(task_id));
        }

        if let Some(task) = state.tasks.get_mut(&task_id) {
            if !task.depends_on.contains(&depends_on) {
                task.depends_on.push(depends_on);
                task.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Claim / start / complete / fail
    // ------------------------------------------------------------------

    /// Tasks ready to hand out for one goal: pending, past backoff, every
    /// dependency completed. Ordered by priority, then creation time,
    /// then id.
    pub async fn claimable_tasks(&self, goal_id: Uuid, priority_floor: i32) -> Vec<Uuid> {
        let state = self.state.read().await;
        let now = Utc::now();
        let Some(task_ids) = state.goal_tasks.get(&goal_id) else {
            return Vec::new();
        };

        let mut ready: Vec<&Task> = task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.priority >= priority_floor)
            .filter(|t| t.not_before.is_none_or(|nb| nb <= now))
            .filter(|t| {
                t.depends_on.iter().all(|dep| {
                    state
                        .tasks
                        .get(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.to_string().cmp(&b.id.to_string()))
        });
        ready.into_iter().map(|t| t.id).collect()
    }

    /// Atomically claim one task for one agent. Losers of a concurrent
    /// claim observe `AlreadyClaimed` and re-poll.
    #[instrument(skip(self), err)]
    pub async fn claim(&self, task_id: Uuid, agent_id: Uuid) -> RuntimeResult<()> {
        let mut state = self.state.write().await;
        let deps_done = {
            let task = state
                .tasks
                .get(&task_id)
                .ok_or(RuntimeError::TaskNotFound(task_id))?;
            match task.status {
                TaskStatus::Pending => {}
                TaskStatus::Claimed | TaskStatus::Running => {
                    return Err(RuntimeError::AlreadyClaimed(task_id));
                }
                other => {
                    return Err(RuntimeError::InvalidTransition {
                        from: other.as_str().to_string(),
                        to: TaskStatus::Claimed.as_str().to_string(),
                    });
                }
            }
            if task.not_before.is_some_and(|nb| nb > Utc::now()) {
                return Err(RuntimeError::ValidationFailed(
                    "Task is backing off".to_string(),
                ));
            }
            task.depends_on.iter().all(|dep| {
                state
                    .tasks
                    .get(dep)
                    .map(|d| d.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
        };
        if !deps_done {
            return Err(RuntimeError::ValidationFailed(
                "Task dependencies are not completed".to_string(),
            ));
        }

        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(RuntimeError::TaskNotFound(task_id))?;
        task.transition_to(TaskStatus::Claimed)?;
        task.claimed_by = Some(agent_id);
        task.claimed_at = Some(Utc::now());
        let goal_id = task.goal_id;
        drop(state);

        self.emit_transition(goal_id, task_id, TaskStatus::Claimed);
        Ok(())
    }

    /// Mark a claimed task running and open its attempt.
    pub async fn start(&self, task_id: Uuid, plugin_id: Option<String>) -> RuntimeResult<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(RuntimeError::TaskNotFound(task_id))?;
        task.transition_to(TaskStatus::Running)?;
        task.open_attempt(plugin_id);
        let goal_id = task.goal_id;
        drop(state);

        self.emit_transition(goal_id, task_id, TaskStatus::Running);
        Ok(())
    }

    /// Complete a running task with its outputs and resource peaks.
    #[instrument(skip(self, outputs, peaks), err)]
    pub async fn complete(
        &self,
        task_id: Uuid,
        outputs: BTreeMap<String, serde_json::Value>,
        peaks: BTreeMap<String, f64>,
    ) -> RuntimeResult<()> {
        let (goal_id, attempt) = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(RuntimeError::TaskNotFound(task_id))?;
            if task.status != TaskStatus::Running {
                return Err(RuntimeError::InvalidTransition {
                    from: task.status.as_str().to_string(),
                    to: TaskStatus::Completed.as_str().to_string(),
                });
            }
            if let Some(open) = task.attempts.iter_mut().rev().find(|a| a.completed_at.is_none()) {
                open.outputs = outputs;
                open.resource_peaks = peaks;
            }
            task.close_attempt(TaskStatus::Completed, None);
            task.transition_to(TaskStatus::Completed)?;
            task.error = None;
            (task.goal_id, task.attempts.last().cloned())
        };

        info!(task_id = %task_id, "Task completed");
        self.emit_transition(goal_id, task_id, TaskStatus::Completed);
        if let Some(attempt) = attempt {
            let _ = self.event_tx.send(SchedulerEvent::AttemptFinished {
                goal_id,
                task_id,
                attempt,
            });
        }
        self.evaluate_goal(goal_id).await;
        Ok(())
    }

    /// Fail a running task. Retryable error classes move it back to
    /// pending with exponential backoff until retries are exhausted.
    #[instrument(skip(self, error), err)]
    pub async fn fail(&self, task_id: Uuid, error: RuntimeError) -> RuntimeResult<()> {
        let terminal = matches!(error, RuntimeError::Timeout { .. })
            .then_some(TaskStatus::Timeout)
            .unwrap_or(TaskStatus::Failed);
        self.fail_with_status(task_id, error, terminal).await
    }

    async fn fail_with_status(
        &self,
        task_id: Uuid,
        error: RuntimeError,
        attempt_status: TaskStatus,
    ) -> RuntimeResult<()> {
        let (goal_id, attempt, final_status) = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(RuntimeError::TaskNotFound(task_id))?;
            if task.status != TaskStatus::Running {
                return Err(RuntimeError::InvalidTransition {
                    from: task.status.as_str().to_string(),
                    to: attempt_status.as_str().to_string(),
                });
            }

            let report = ErrorReport::from_error(&error).with_task(task_id);
            task.close_attempt(attempt_status, Some(report.clone()));
            task.error = Some(report);

            // Running -> timeout|failed records the run's outcome; what
            // happens next depends on the retry budget.
            task.transition_to(attempt_status)?;

            let final_status = if error.is_retryable() && task.can_retry() {
                task.retry_count += 1;
                task.not_before = Some(Utc::now() + task.retry_backoff());
                task.transition_to(TaskStatus::Pending)?;
                TaskStatus::Pending
            } else {
                if attempt_status == TaskStatus::Timeout {
                    task.transition_to(TaskStatus::Failed)?;
                }
                TaskStatus::Failed
            };
            (task.goal_id, task.attempts.last().cloned(), final_status)
        };

        warn!(task_id = %task_id, status = final_status.as_str(), "Task run failed");
        self.emit_transition(goal_id, task_id, final_status);
        if let Some(attempt) = attempt {
            let _ = self.event_tx.send(SchedulerEvent::AttemptFinished {
                goal_id,
                task_id,
                attempt,
            });
        }

        if final_status == TaskStatus::Failed {
            self.block_dependents(task_id).await;
            self.evaluate_goal(goal_id).await;
        }
        Ok(())
    }

    /// Move a claimed or running task back to pending for another agent,
    /// recording a released attempt and consuming a retry.
    #[instrument(skip(self), err)]
    pub async fn release(&self, task_id: Uuid) -> RuntimeResult<()> {
        let (goal_id, attempt, requeued) = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(RuntimeError::TaskNotFound(task_id))?;
            if !matches!(task.status, TaskStatus::Claimed | TaskStatus::Running) {
                return Err(RuntimeError::InvalidTransition {
                    from: task.status.as_str().to_string(),
                    to: TaskStatus::Released.as_str().to_string(),
                });
            }
            let had_open_attempt = task.attempts.iter().any(|a| a.completed_at.is_none());
            task.close_attempt(TaskStatus::Released, None);
            task.transition_to(TaskStatus::Released)?;
            task.retry_count += 1;
            // A release consumes a retry; an exhausted budget fails the
            // task instead of requeueing it forever.
            let requeued = if task.retry_count <= task.max_retries {
                task.transition_to(TaskStatus::Pending)?;
                TaskStatus::Pending
            } else {
                task.error = Some(ErrorReport {
                    kind: crate::domain::errors::ErrorKind::Transient,
                    message: "Retry budget exhausted after release".to_string(),
                    owner_id: None,
                    task_id: Some(task_id),
                    plugin_id: None,
                });
                task.transition_to(TaskStatus::Failed)?;
                TaskStatus::Failed
            };
            let attempt = had_open_attempt
                .then(|| task.attempts.last().cloned())
                .flatten();
            (task.goal_id, attempt, requeued)
        };

        self.emit_transition(goal_id, task_id, requeued);
        if let Some(attempt) = attempt {
            let _ = self.event_tx.send(SchedulerEvent::AttemptFinished {
                goal_id,
                task_id,
                attempt,
            });
        }
        if requeued == TaskStatus::Failed {
            self.block_dependents(task_id).await;
            self.evaluate_goal(goal_id).await;
        }
        Ok(())
    }

    /// Reassign a claimed or running task to another agent.
    pub async fn reassign(&self, task_id: Uuid, new_agent_id: Uuid) -> RuntimeResult<()> {
        self.release(task_id).await?;
        self.claim(task_id, new_agent_id).await
    }

    /// Release every task held by one agent (heartbeat-loss recovery).
    /// Returns the released task ids.
    pub async fn release_tasks_of(&self, agent_id: Uuid) -> Vec<Uuid> {
        let held: Vec<Uuid> = {
            let state = self.state.read().await;
            state
                .tasks
                .values()
                .filter(|t| t.claimed_by == Some(agent_id))
                .map(|t| t.id)
                .collect()
        };
        let mut released = Vec::with_capacity(held.len());
        for task_id in held {
            match self.release(task_id).await {
                Ok(()) => released.push(task_id),
                Err(e) => warn!(task_id = %task_id, error = %e, "Failed to release task"),
            }
        }
        released
    }

    /// Block a claimed or pending task, recording why. Used when a
    /// dependency failed or the resolved plugin disappeared.
    pub async fn block(&self, task_id: Uuid, reason: impl Into<String>) -> RuntimeResult<()> {
        let goal_id = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(RuntimeError::TaskNotFound(task_id))?;
            task.transition_to(TaskStatus::Blocked)?;
            task.error = Some(ErrorReport {
                kind: crate::domain::errors::ErrorKind::Input,
                message: reason.into(),
                owner_id: None,
                task_id: Some(task_id),
                plugin_id: None,
            });
            task.goal_id
        };
        self.emit_transition(goal_id, task_id, TaskStatus::Blocked);
        Ok(())
    }

    /// Unblock tasks of a type whose missing capability has appeared.
    pub async fn unblock_task_type(&self, task_type: &str) -> usize {
        let mut unblocked = 0;
        let mut state = self.state.write().await;
        let ids: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Blocked && t.task_type == task_type)
            .map(|t| t.id)
            .collect();
        for id in ids {
            if let Some(task) = state.tasks.get_mut(&id) {
                if task.transition_to(TaskStatus::Pending).is_ok() {
                    task.error = None;
                    unblocked += 1;
                }
            }
        }
        unblocked
    }

    /// Running tasks past their deadline, moved to timeout and either
    /// retried or failed. Returns `(goal_id, task_id)` pairs.
    pub async fn check_timeouts(&self) -> Vec<(Uuid, Uuid)> {
        let now = Utc::now();
        let expired: Vec<(Uuid, Uuid, u64)> = {
            let state = self.state.read().await;
            state
                .tasks
                .values()
                .filter(|t| t.is_timed_out(now))
                .map(|t| (t.goal_id, t.id, t.timeout_secs))
                .collect()
        };

        for (_, task_id, timeout_secs) in &expired {
            let result = self
                .fail_with_status(
                    *task_id,
                    RuntimeError::Timeout {
                        timeout_secs: *timeout_secs,
                    },
                    TaskStatus::Timeout,
                )
                .await;
            if let Err(e) = result {
                warn!(task_id = %task_id, error = %e, "Timeout handling failed");
            }
        }
        expired.into_iter().map(|(g, t, _)| (g, t)).collect()
    }

    // ------------------------------------------------------------------
    // Goal lifecycle
    // ------------------------------------------------------------------

    /// Idempotent cancel cascade: the goal and every non-terminal task
    /// move to cancelled. Returns the agents that held claims.
    pub async fn cancel_goal(&self, goal_id: Uuid) -> RuntimeResult<Vec<Uuid>> {
        let mut owners = Vec::new();
        let mut transitions = Vec::new();
        {
            let mut state = self.state.write().await;
            let goal = state
                .goals
                .get_mut(&goal_id)
                .ok_or(RuntimeError::GoalNotFound(goal_id))?;
            if goal.status.is_terminal() {
                return Ok(Vec::new());
            }
            goal.set_status(GoalStatus::Cancelled);

            let task_ids = state.goal_tasks.get(&goal_id).cloned().unwrap_or_default();
            for task_id in task_ids {
                let Some(task) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if task.is_terminal() {
                    continue;
                }
                if let Some(agent) = task.claimed_by {
                    owners.push(agent);
                }
                if task.status == TaskStatus::Running || task.status == TaskStatus::Claimed {
                    task.close_attempt(TaskStatus::Cancelled, None);
                }
                task.force_status(TaskStatus::Cancelled, "goal cancelled");
                transitions.push(task_id);
            }
        }

        for task_id in transitions {
            self.emit_transition(goal_id, task_id, TaskStatus::Cancelled);
        }
        let _ = self.event_tx.send(SchedulerEvent::GoalFinished {
            goal_id,
            status: GoalStatus::Cancelled,
        });
        info!(goal_id = %goal_id, "Goal cancelled");
        Ok(owners)
    }

    /// Mark a scheduled goal as running once its fleet is up.
    pub async fn mark_goal_running(&self, goal_id: Uuid) -> RuntimeResult<()> {
        let mut state = self.state.write().await;
        let goal = state
            .goals
            .get_mut(&goal_id)
            .ok_or(RuntimeError::GoalNotFound(goal_id))?;
        if goal.status == GoalStatus::Scheduled {
            goal.set_status(GoalStatus::Running);
        }
        Ok(())
    }

    /// Re-evaluate a goal after a terminal task event.
    async fn evaluate_goal(&self, goal_id: Uuid) {
        let finished = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(task_ids) = state.goal_tasks.get(&goal_id).cloned() else {
                return;
            };
            let tasks: Vec<&Task> = task_ids
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .collect();

            // Non-terminal work remains; blocked dependents of a failed
            // ancestor wait for operator policy, unless that ancestor was
            // critical, in which case the goal has already failed.
            let critical_failed = tasks
                .iter()
                .any(|t| t.critical && t.status == TaskStatus::Failed);
            let all_terminal = tasks.iter().all(|t| t.is_terminal());
            if !all_terminal && !critical_failed {
                return;
            }

            let status = if critical_failed {
                GoalStatus::Failed
            } else if tasks
                .iter()
                .all(|t| t.status == TaskStatus::Completed && criteria_met(t))
            {
                GoalStatus::Completed
            } else {
                GoalStatus::Failed
            };

            let first_error = tasks.iter().find_map(|t| t.error.clone());
            let Some(goal) = state.goals.get_mut(&goal_id) else {
                return;
            };
            if goal.status.is_terminal() {
                return;
            }
            goal.set_status(status);
            if status == GoalStatus::Failed {
                goal.error = first_error.map(|e| e.message);
            }
            status
        };

        info!(goal_id = %goal_id, status = finished.as_str(), "Goal finished");
        let _ = self.event_tx.send(SchedulerEvent::GoalFinished {
            goal_id,
            status: finished,
        });
    }

    /// Dependents of a permanently failed task become blocked with an
    /// explanatory error; they do not automatically fail.
    async fn block_dependents(&self, failed_task: Uuid) {
        let dependents: Vec<Uuid> = {
            let state = self.state.read().await;
            state
                .tasks
                .values()
                .filter(|t| t.depends_on.contains(&failed_task))
                .filter(|t| t.status == TaskStatus::Pending)
                .map(|t| t.id)
                .collect()
        };
        for task_id in dependents {
            let reason = format!("Dependency {failed_task} failed");
            if let Err(e) = self.block(task_id, reason).await {
                debug!(task_id = %task_id, error = %e, "Could not block dependent");
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.state.read().await.tasks.get(&task_id).cloned()
    }

    pub async fn get_goal(&self, goal_id: Uuid) -> Option<Goal> {
        self.state.read().await.goals.get(&goal_id).cloned()
    }

    pub async fn goal_tasks(&self, goal_id: Uuid) -> Vec<Task> {
        let state = self.state.read().await;
        state
            .goal_tasks
            .get(&goal_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.tasks.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn list_goals(&self) -> Vec<Goal> {
        let state = self.state.read().await;
        let mut goals: Vec<Goal> = state.goals.values().cloned().collect();
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        goals
    }

    /// Progress counts for the HTTP facade.
    pub async fn goal_progress(&self, goal_id: Uuid) -> Option<GoalProgress> {
        let state = self.state.read().await;
        let goal = state.goals.get(&goal_id)?;
        let task_ids = state.goal_tasks.get(&goal_id)?;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for id in task_ids {
            if let Some(task) = state.tasks.get(id) {
                *counts.entry(task.status.as_str().to_string()).or_default() += 1;
            }
        }
        Some(GoalProgress {
            goal_id,
            status: goal.status,
            counts,
            total: task_ids.len(),
        })
    }

    /// Non-terminal tasks whose current run uses the given plugin. Used
    /// to refuse unregistering a plugin still in use.
    pub async fn tasks_using_plugin(&self, plugin_id: &str) -> Vec<Uuid> {
        let state = self.state.read().await;
        state
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .filter(|t| {
                t.attempts
                    .last()
                    .and_then(|a| a.plugin_id.as_deref())
                    .is_some_and(|p| p == plugin_id)
            })
            .map(|t| t.id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Snapshot support
    // ------------------------------------------------------------------

    /// Coherent copy of goals and tasks for a checkpoint.
    pub async fn snapshot(&self) -> (Vec<Goal>, Vec<Task>) {
        let state = self.state.read().await;
        let mut goals: Vec<Goal> = state.goals.values().cloned().collect();
        goals.sort_by_key(|g| g.id);
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        (goals, tasks)
    }

    /// Reload from a snapshot. Tasks that were claimed or running when
    /// the snapshot was taken go back to pending with a consumed retry
    /// before scheduling resumes.
    pub async fn restore(&self, goals: Vec<Goal>, mut tasks: Vec<Task>) {
        for task in &mut tasks {
            if matches!(task.status, TaskStatus::Claimed | TaskStatus::Running) {
                task.close_attempt(TaskStatus::Released, None);
                task.retry_count += 1;
                task.force_status(TaskStatus::Pending, "snapshot restore");
            }
        }

        let mut state = self.state.write().await;
        state.goals.clear();
        state.tasks.clear();
        state.goal_tasks.clear();
        for goal in goals {
            state.goal_tasks.entry(goal.id).or_default();
            state.goals.insert(goal.id, goal);
        }
        for task in tasks {
            state
                .goal_tasks
                .entry(task.goal_id)
                .or_default()
                .push(task.id);
            state.tasks.insert(task.id, task);
        }
    }

    fn emit_transition(&self, goal_id: Uuid, task_id: Uuid, status: TaskStatus) {
        let _ = self.event_tx.send(SchedulerEvent::TaskTransition {
            goal_id,
            task_id,
            status,
        });
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// At least one terminal attempt must satisfy every criterion.
fn criteria_met(task: &Task) -> bool {
    if task.success_criteria.is_empty() {
        return true;
    }
    task.attempts
        .iter()
        .filter(|a| a.status == TaskStatus::Completed)
        .any(|a| {
            task.success_criteria
                .iter()
                .all(|c| c.is_satisfied(&a.outputs))
        })
}
