//! Built-in deterministic planner backing the planner role.
//!
//! Decomposition happens in the planner role; the orchestrator only
//! consumes the result. This planner maps a goal's declared capabilities
//! onto one task each, falling back to a single relay task for goals
//! with no declared capabilities.

use serde_json::json;

use crate::domain::models::goal::{Decomposition, Goal, TaskDescriptor};

/// Capability served by the built-in relay plugin, used when a goal
/// declares nothing else.
pub const FALLBACK_CAPABILITY: &str = "echo";

/// Deterministic goal decomposition.
#[derive(Debug, Clone, Default)]
pub struct BuiltinPlanner;

impl BuiltinPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Produce a decomposition for a goal.
    pub fn decompose(&self, goal: &Goal) -> Decomposition {
        let mut tasks = Vec::new();

        if goal.required_capabilities.is_empty() {
            tasks.push(
                TaskDescriptor::new(FALLBACK_CAPABILITY)
                    .with_config(json!({ "input": goal.description })),
            );
        } else {
            for capability in &goal.required_capabilities {
                tasks.push(
                    TaskDescriptor::new(capability.clone())
                        .with_config(json!({ "input": goal.description })),
                );
            }
        }

        Decomposition {
            tasks,
            required_capabilities: goal.required_capabilities.clone(),
            ..Decomposition::default()
        }
    }
}
