//! Error taxonomy for the panion runtime.
//!
//! Errors cross component boundaries as typed values on channels; no
//! component raises across a boundary. Every error carries enough owner
//! context to be appended to the owning attempt and logged.

use thiserror::Error;
use uuid::Uuid;

/// Broad classification used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad goal, invalid decomposition, unknown capability. Never retried.
    Input,
    /// Timeout, quota, sample drop, startup race. Retried within `max_retries`.
    Transient,
    /// Plugin execution or wire-contract failure. Counted against the plugin score.
    Plugin,
    /// Allocation refused, fleet under-sized. Retried with backoff, then degraded.
    Resource,
    /// Snapshot corrupt, registry index unreadable, pool negative. Halts the runtime.
    Fatal,
}

impl ErrorKind {
    /// Whether the scheduler may retry a task that failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Resource)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Transient => "transient",
            Self::Plugin => "plugin",
            Self::Resource => "resource",
            Self::Fatal => "fatal",
        }
    }
}

/// Runtime errors, one variant per §7-style failure family.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum RuntimeError {
    #[error("Goal not found: {0}")]
    GoalNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Task {0} is already claimed")]
    AlreadyClaimed(Uuid),

    #[error("Dependency cycle detected involving task {0}")]
    DependencyCycle(Uuid),

    #[error("Decomposition confidence {confidence:.2} below threshold {threshold:.2}")]
    InsufficientPlan { confidence: f64, threshold: f64 },

    #[error("Capability not available: {0}")]
    CapabilityGap(String),

    #[error("Execution timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Quota exceeded on {axis} for {owner}")]
    QuotaExceeded { owner: String, axis: String },

    #[error("Plugin {plugin_id} failed: {message}")]
    PluginFailed { plugin_id: String, message: String },

    #[error("Cancel requested")]
    CancelRequested,

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Role {0} is disabled pending operator intervention")]
    RoleDisabled(String),

    #[error("Permission denied for role {role}: {action}")]
    PermissionDenied { role: String, action: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Wire protocol violation: {0}")]
    WireProtocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Classify this error into the retry/reporting taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GoalNotFound(_)
            | Self::TaskNotFound(_)
            | Self::AgentNotFound(_)
            | Self::PluginNotFound(_)
            | Self::InsufficientPlan { .. }
            | Self::CapabilityGap(_)
            | Self::PermissionDenied { .. }
            | Self::ValidationFailed(_)
            | Self::InvalidTransition { .. }
            | Self::AlreadyClaimed(_)
            | Self::DependencyCycle(_) => ErrorKind::Input,
            Self::Timeout { .. } | Self::QuotaExceeded { .. } | Self::CancelRequested => {
                ErrorKind::Transient
            }
            Self::PluginFailed { .. } | Self::WireProtocol(_) | Self::SynthesisFailed(_) => {
                ErrorKind::Plugin
            }
            Self::InsufficientResources(_) | Self::RoleDisabled(_) => ErrorKind::Resource,
            Self::Snapshot(_) | Self::Storage(_) | Self::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the scheduler may move a task that failed with this error
    /// back to pending.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Transient plugin failures are retried; the registry score
            // decides whether the plugin stays resolvable.
            Self::PluginFailed { .. } => true,
            other => other.kind().is_retryable(),
        }
    }
}

/// An error annotated with the ids it belongs to, as it travels over
/// channels and into attempt history.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
}

impl ErrorReport {
    pub fn from_error(err: &RuntimeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            owner_id: None,
            task_id: None,
            plugin_id: None,
        }
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_id = Some(owner.into());
        self
    }
}

/// Result alias used across the runtime.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RuntimeError::Timeout { timeout_secs: 30 }.is_retryable());
        assert!(RuntimeError::QuotaExceeded {
            owner: "p".into(),
            axis: "memory".into()
        }
        .is_retryable());
        assert!(RuntimeError::PluginFailed {
            plugin_id: "p@1.0.0".into(),
            message: "boom".into()
        }
        .is_retryable());

        assert!(!RuntimeError::ValidationFailed("bad".into()).is_retryable());
        assert!(!RuntimeError::Internal("bad".into()).is_retryable());
    }

    #[test]
    fn test_report_carries_owner_context() {
        let err = RuntimeError::Timeout { timeout_secs: 5 };
        let task_id = Uuid::new_v4();
        let report = ErrorReport::from_error(&err)
            .with_task(task_id)
            .with_plugin("doubler@1.0.0");

        assert_eq!(report.kind, ErrorKind::Transient);
        assert_eq!(report.task_id, Some(task_id));
        assert_eq!(report.plugin_id.as_deref(), Some("doubler@1.0.0"));
    }

    #[test]
    fn test_kind_as_str() {
        assert_eq!(ErrorKind::Fatal.as_str(), "fatal");
        assert_eq!(ErrorKind::Transient.as_str(), "transient");
    }
}
