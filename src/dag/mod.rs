// src/dag/mod.rs

//! Compile task graph and its per-run state.
//!
//! - [`graph`] builds one task per `(package, stemcell)` pair from the jobs.
//! - [`keys`] computes dependency and cache keys.
//! - [`task_info`] holds the task type, its status and the worker snapshot.
//! - [`state_manager`] performs status transitions and computes ready sets.
//! - [`scheduler_step`] defines the result type for those transitions.

pub mod graph;
pub mod keys;
pub mod scheduler_step;
pub mod state_manager;
pub mod task_info;

pub use graph::CompileGraph;
pub use scheduler_step::CompileStep;
pub use state_manager::{ReadOnlyStateManager, StateManager};
pub use task_info::{CompileTask, ScheduledCompile, TaskKey, TaskStatus};
