// src/engine/events.rs

//! Stage/track style progress reporting.

use tracing::{info, warn};

/// Sink for user-facing progress of a run.
pub trait EventLog: Send + Sync {
    /// A new stage with `total` tracked entries begins.
    fn begin_stage(&self, stage: &str, total: usize);

    fn track_started(&self, stage: &str, task: &str);

    /// `error` is `None` on success.
    fn track_finished(&self, stage: &str, task: &str, error: Option<&str>);
}

/// Writes progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn begin_stage(&self, stage: &str, total: usize) {
        info!(stage = %stage, total, "stage started");
    }

    fn track_started(&self, stage: &str, task: &str) {
        info!(stage = %stage, task = %task, "started");
    }

    fn track_finished(&self, stage: &str, task: &str, error: Option<&str>) {
        match error {
            None => info!(stage = %stage, task = %task, "finished"),
            Some(err) => warn!(stage = %stage, task = %task, error = %err, "failed"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventLog;

impl EventLog for NullEventLog {
    fn begin_stage(&self, _stage: &str, _total: usize) {}

    fn track_started(&self, _stage: &str, _task: &str) {}

    fn track_finished(&self, _stage: &str, _task: &str, _error: Option<&str>) {}
}
