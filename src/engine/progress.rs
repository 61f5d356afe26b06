// src/engine/progress.rs

//! Hooks into the director task that owns a compilation run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::Result;

/// The director task driving this run.
///
/// The compiler polls [`DirectorTask::task_cancelled`] once per dispatch
/// wave and calls [`DirectorTask::task_checkpoint`] whenever it is about to
/// start work.
pub trait DirectorTask: Send + Sync {
    fn task_cancelled(&self) -> bool;

    /// Progress/liveness checkpoint. An error aborts the run.
    fn task_checkpoint(&self) -> Result<()> {
        Ok(())
    }
}

/// Cooperative cancellation flag shared between the director and a run.
///
/// Cancelling never interrupts compilations already in flight; it only
/// stops new ones from being dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl DirectorTask for CancellationToken {
    fn task_cancelled(&self) -> bool {
        self.is_cancelled()
    }
}
