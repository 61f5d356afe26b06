// src/dag/scheduler_step.rs

//! Result type for graph state transitions.

use crate::dag::task_info::TaskKey;

/// What changed after recording a task outcome.
///
/// Tests use this to step the graph by hand and assert on dispatch order.
#[derive(Debug, Clone, Default)]
pub struct CompileStep {
    /// Dependents whose dependencies are now all compiled.
    pub newly_eligible: Vec<TaskKey>,
    /// The task that failed in this step, if any.
    pub failed: Option<TaskKey>,
}
