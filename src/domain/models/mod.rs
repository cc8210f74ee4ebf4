//! Domain models shared across the runtime's components.

pub mod agent;
pub mod capability;
pub mod config;
pub mod goal;
pub mod plugin;
pub mod resource;
pub mod task;

pub use agent::{Agent, AgentRole, AgentStatus, RolePolicy};
pub use capability::{CapabilityGap, GapStatus, SynthesisRequirement, SynthesisTestCase};
pub use config::Config;
pub use goal::{Decomposition, Goal, GoalStatus, SuccessCriterion, TaskDescriptor};
pub use plugin::{
    plugin_id, PluginMetadata, PluginScore, PluginStatus, VersionConstraint,
    DEFAULT_HEALTH_THRESHOLD,
};
pub use resource::{
    ResourceAxis, ResourcePool, ResourceQuota, ResourceSample, RollingWindow,
};
pub use task::{Attempt, Task, TaskStatus};
