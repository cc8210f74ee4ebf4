//! Goal and decomposition domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Confidence floor below which orchestration refuses a plan.
pub const MIN_PLAN_CONFIDENCE: f64 = 0.4;

/// Lifecycle status of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Default for GoalStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "scheduled" => Some(Self::Scheduled),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A user-submitted high-level objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Unique identifier
    pub id: Uuid,
    /// Human description
    pub description: String,
    /// Higher first
    pub priority: i32,
    /// Lifecycle status
    pub status: GoalStatus,
    /// Capabilities the goal declares up front
    pub required_capabilities: BTreeSet<String>,
    /// Optional deadline
    pub deadline: Option<DateTime<Utc>>,
    /// Attached decomposition once planned
    pub decomposition: Option<Decomposition>,
    /// First fatal error, if the goal failed
    pub error: Option<String>,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When last updated
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(description: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            priority,
            status: GoalStatus::Pending,
            required_capabilities: BTreeSet::new(),
            deadline: None,
            decomposition: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.required_capabilities.insert(cap.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn set_status(&mut self, status: GoalStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("Goal description cannot be empty".to_string());
        }
        Ok(())
    }
}

/// A predicate evaluated against a task's terminal attempt outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuccessCriterion {
    /// Numeric output at `key` must be >= `min`
    Threshold { key: String, min: f64 },
    /// Output at `key` must deep-equal `value`
    Exact {
        key: String,
        value: serde_json::Value,
    },
    /// String output at `key` must match `pattern` (regex)
    Pattern { key: String, pattern: String },
    /// Named operator-supplied predicate; unsatisfied when unknown
    Custom {
        name: String,
        #[serde(default)]
        config: serde_json::Value,
    },
}

impl SuccessCriterion {
    /// Evaluate against a map of attempt outputs. Unknown custom
    /// predicates evaluate to false rather than erroring.
    pub fn is_satisfied(&self, outputs: &BTreeMap<String, serde_json::Value>) -> bool {
        match self {
            Self::Threshold { key, min } => outputs
                .get(key)
                .and_then(serde_json::Value::as_f64)
                .map(|v| v >= *min)
                .unwrap_or(false),
            Self::Exact { key, value } => outputs.get(key) == Some(value),
            Self::Pattern { key, pattern } => {
                let Some(text) = outputs.get(key).and_then(serde_json::Value::as_str) else {
                    return false;
                };
                regex::Regex::new(pattern)
                    .map(|re| re.is_match(text))
                    .unwrap_or(false)
            }
            Self::Custom { name, .. } => {
                tracing::debug!(predicate = %name, "Unknown custom criterion evaluates false");
                false
            }
        }
    }
}

/// One task in a decomposition, before scheduler registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Pre-assigned task id, referenced by the dependency map
    pub id: Uuid,
    /// Type tag; doubles as the required capability
    pub task_type: String,
    /// Opaque plugin configuration
    #[serde(default)]
    pub config: serde_json::Value,
    /// Priority override; inherits the goal priority when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Whether failure of this task fails the goal (default: yes)
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Per-task success criteria
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
}

fn default_critical() -> bool {
    true
}

impl TaskDescriptor {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            config: serde_json::Value::Null,
            priority: None,
            timeout_secs: None,
            max_retries: None,
            critical: true,
            success_criteria: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_criterion(mut self, criterion: SuccessCriterion) -> Self {
        self.success_criteria.push(criterion);
        self
    }
}

/// The planner's answer for a goal: tasks, a DAG over them, and what the
/// run needs to succeed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Decomposition {
    /// Ordered task descriptors
    pub tasks: Vec<TaskDescriptor>,
    /// task id -> set of task ids it depends on (acyclic)
    pub dependencies: BTreeMap<Uuid, BTreeSet<Uuid>>,
    /// Resource name -> amount to reserve for the run
    #[serde(default)]
    pub required_resources: BTreeMap<String, f64>,
    /// Goal-level success criteria, applied to every task without its own
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    /// Capability tags the run needs
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
}

impl Decomposition {
    /// Scalar confidence in [0, 1]: base 0.5, plus 0.2 for subtasks, 0.1
    /// each for dependencies, declared resources, and success criteria.
    pub fn confidence(&self) -> f64 {
        let mut confidence: f64 = 0.5;
        if !self.tasks.is_empty() {
            confidence += 0.2;
        }
        if self.dependencies.values().any(|deps| !deps.is_empty()) {
            confidence += 0.1;
        }
        if !self.required_resources.is_empty() {
            confidence += 0.1;
        }
        if !self.success_criteria.is_empty()
            || self.tasks.iter().any(|t| !t.success_criteria.is_empty())
        {
            confidence += 0.1;
        }
        confidence.min(1.0)
    }

    /// Dependencies declared for a descriptor.
    pub fn deps_of(&self, task_id: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        self.dependencies
            .get(&task_id)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_goal_validation() {
        assert!(Goal::new("  ", 0).validate().is_err());
        assert!(Goal::new("scrape the catalog", 0).validate().is_ok());
    }

    #[test]
    fn test_confidence_scoring() {
        let empty = Decomposition::default();
        assert!((empty.confidence() - 0.5).abs() < f64::EPSILON);

        let t1 = TaskDescriptor::new("fetch");
        let t2 = TaskDescriptor::new("parse");
        let mut dec = Decomposition {
            tasks: vec![t1.clone(), t2.clone()],
            ..Decomposition::default()
        };
        assert!((dec.confidence() - 0.7).abs() < f64::EPSILON);

        dec.dependencies
            .entry(t2.id)
            .or_default()
            .insert(t1.id);
        dec.required_resources.insert("memory_mb".into(), 256.0);
        dec.success_criteria.push(SuccessCriterion::Threshold {
            key: "rows".into(),
            min: 1.0,
        });
        assert!((dec.confidence() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_threshold_criterion() {
        let criterion = SuccessCriterion::Threshold {
            key: "rows".into(),
            min: 10.0,
        };
        let mut outputs = BTreeMap::new();
        outputs.insert("rows".to_string(), json!(12));
        assert!(criterion.is_satisfied(&outputs));

        outputs.insert("rows".to_string(), json!(3));
        assert!(!criterion.is_satisfied(&outputs));

        outputs.remove("rows");
        assert!(!criterion.is_satisfied(&outputs));
    }

    #[test]
    fn test_exact_and_pattern_criteria() {
        let mut outputs = BTreeMap::new();
        outputs.insert("state".to_string(), json!("done: 42 rows"));

        let exact = SuccessCriterion::Exact {
            key: "state".into(),
            value: json!("done: 42 rows"),
        };
        assert!(exact.is_satisfied(&outputs));

        let pattern = SuccessCriterion::Pattern {
            key: "state".into(),
            pattern: r"^done: \d+ rows$".into(),
        };
        assert!(pattern.is_satisfied(&outputs));

        let miss = SuccessCriterion::Pattern {
            key: "state".into(),
            pattern: r"^failed".into(),
        };
        assert!(!miss.is_satisfied(&outputs));
    }

    #[test]
    fn test_unknown_custom_criterion_is_unsatisfied() {
        let criterion = SuccessCriterion::Custom {
            name: "operator_signoff".into(),
            config: json!({}),
        };
        assert!(!criterion.is_satisfied(&BTreeMap::new()));
    }
}
