// src/engine/mod.rs

//! Compilation engine.
//!
//! This module ties together:
//! - the compile graph and its state manager (from [`crate::dag`])
//! - the compile lock serialising work on a `(package, stemcell)` pair
//! - the optional global cache
//! - the instance pool workers compile on
//!
//! [`compiler::PackageCompiler`] is the control loop; [`worker`] holds what
//! each dispatched task does.

use crate::dag::{TaskKey, TaskStatus};

/// Event log stage under which compile tasks are tracked.
pub const COMPILE_STAGE: &str = "Compiling packages";

/// Progress reported by workers back to the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    StatusChanged { key: TaskKey, status: TaskStatus },
}

pub mod cache;
pub mod compiler;
pub mod events;
pub mod lock;
pub mod progress;
pub mod worker;

pub use cache::GlobalCache;
pub use compiler::PackageCompiler;
pub use events::{EventLog, NullEventLog, TracingEventLog};
pub use lock::{CompileLock, InMemoryLockBackend, LeaseStatus, LockAttempt, LockBackend};
pub use progress::{CancellationToken, DirectorTask};
pub use worker::{ArtifactSource, CompileOutcome};
