//! Component boundary contracts.
//!
//! The plugin contract is a single typed interface plus a declarative
//! manifest; runtime discovery is a startup-time manifest scan, never
//! reflective method lookup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::RuntimeResult;

/// Who asked for an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// A worker agent, by id
    Agent(uuid::Uuid),
    /// The synthesis pipeline testing a candidate
    Synthesizer,
    /// Operator or test harness
    Operator,
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "agent:{id}"),
            Self::Synthesizer => write!(f, "synthesizer"),
            Self::Operator => write!(f, "operator"),
        }
    }
}

/// Per-call execution context handed to in-process plugins.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Correlation id; resource samples are attributed to it
    pub correlation_id: String,
    /// Hard deadline for the call
    pub deadline: DateTime<Utc>,
    /// Cooperative cancellation; plugins should poll it at await points
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(correlation_id: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether the caller asked this execution to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The typed plugin contract: `initialize`, `execute`, `cleanup`.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// One-time setup before the first execution.
    async fn initialize(&self) -> RuntimeResult<()> {
        Ok(())
    }

    /// Run one input to one output.
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<serde_json::Value>;

    /// Teardown when the plugin is stopped.
    async fn cleanup(&self) -> RuntimeResult<()> {
        Ok(())
    }
}

/// Resolved implementation of a registered plugin.
#[derive(Clone)]
pub enum PluginHandle {
    /// Trusted in-process implementation
    Native(Arc<dyn Plugin>),
    /// Subprocess speaking the wire protocol from its materialized
    /// directory; container mode spawns this
    Command {
        program: PathBuf,
        args: Vec<String>,
        plugin_dir: PathBuf,
    },
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(_) => f.write_str("PluginHandle::Native"),
            Self::Command { program, plugin_dir, .. } => f
                .debug_struct("PluginHandle::Command")
                .field("program", program)
                .field("plugin_dir", plugin_dir)
                .finish(),
        }
    }
}

impl PluginHandle {
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }
}
