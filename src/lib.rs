//! Panion - autonomous agent orchestration runtime
//!
//! A Rust rewrite of the Panion orchestration system with:
//! - Goal decomposition into dependency-ordered task graphs
//! - Role-typed worker agents with quotas and heartbeat recovery
//! - Versioned plugin registry with capability lookup and rolling scores
//! - Sandboxed plugin execution (subprocess wire protocol or in-process)
//! - Plugin synthesis from templates, tested and refined before register
//! - Periodic atomic state snapshots with restore on startup

pub mod api;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod runtime;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{RuntimeError, RuntimeResult};
pub use domain::models::Config;
pub use runtime::Runtime;
