// src/dag/state_manager.rs

//! Per-run state transitions for compile tasks.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::dag::graph::CompileGraph;
use crate::dag::scheduler_step::CompileStep;
use crate::dag::task_info::{ScheduledCompile, TaskKey, TaskStatus};
use crate::types::{CompiledPackage, PackageDescriptor};

/// Drives status transitions on a [`CompileGraph`].
pub struct StateManager<'a> {
    graph: &'a mut CompileGraph,
}

impl<'a> StateManager<'a> {
    pub fn new(graph: &'a mut CompileGraph) -> Self {
        Self { graph }
    }

    /// Whether every direct dependency of `key` has a compiled package.
    pub fn deps_compiled(&self, key: TaskKey) -> bool {
        ReadOnlyStateManager::new(&*self.graph).deps_compiled(key)
    }

    /// Pick up to `limit` pending tasks whose dependencies are compiled,
    /// mark them `Ready` and return what the workers need to compile them.
    pub fn collect_ready(&mut self, limit: usize) -> Vec<ScheduledCompile> {
        let candidates: Vec<TaskKey> = {
            let ro = ReadOnlyStateManager::new(&*self.graph);
            self.graph
                .keys()
                .iter()
                .copied()
                .filter(|key| {
                    self.graph
                        .task(key)
                        .is_some_and(|t| t.status == TaskStatus::Pending)
                        && ro.deps_compiled(*key)
                })
                .take(limit)
                .collect()
        };

        let mut ready = Vec::with_capacity(candidates.len());
        for key in candidates {
            let dependencies = self.immediate_dependencies(key);
            if let Some(task) = self.graph.task_mut(&key) {
                debug!(
                    package = %task.package.desc(),
                    stemcell = %task.stemcell.desc(),
                    "dependencies compiled; marking Ready"
                );
                task.status = TaskStatus::Ready;
                ready.push(ScheduledCompile {
                    key,
                    package: task.package.clone(),
                    stemcell: task.stemcell.clone(),
                    dependency_key: task.dependency_key.clone(),
                    cache_key: task.cache_key.clone(),
                    dependencies,
                });
            }
        }
        ready
    }

    /// Descriptors of the compiled direct dependencies of `key`.
    fn immediate_dependencies(&self, key: TaskKey) -> BTreeMap<String, PackageDescriptor> {
        self.graph
            .dependencies_of(key)
            .into_iter()
            .filter_map(|dep| self.graph.task(&dep))
            .filter_map(|dep| dep.compiled_package.as_ref())
            .map(|cp| (cp.package_name.clone(), cp.descriptor()))
            .collect()
    }

    /// Record a status reported by a worker.
    ///
    /// Terminal states are only set through [`Self::mark_compiled`] and
    /// [`Self::mark_failed`].
    pub fn mark_status(&mut self, key: TaskKey, status: TaskStatus) {
        let deps_compiled = self.deps_compiled(key);
        match self.graph.task_mut(&key) {
            Some(task) if !task.status.is_terminal() => {
                if status == TaskStatus::Compiling && !deps_compiled {
                    warn!(
                        package = %task.package.desc(),
                        "task reported Compiling before its dependencies were compiled"
                    );
                }
                debug!(package = %task.package.desc(), ?status, "task status changed");
                task.status = status;
            }
            Some(_) => {}
            None => warn!(task = %key, "status for unknown task; ignoring"),
        }
    }

    /// Record the compiled package for `key`, notify its jobs and report
    /// which dependents became eligible for dispatch.
    pub fn mark_compiled(&mut self, key: TaskKey, compiled_package: CompiledPackage) -> CompileStep {
        match self.graph.task_mut(&key) {
            Some(task) => task.use_compiled_package(compiled_package),
            None => {
                warn!(task = %key, "compiled package for unknown task; ignoring");
                return CompileStep::default();
            }
        }

        let newly_eligible = self
            .graph
            .dependents_of(key)
            .into_iter()
            .filter(|dep| {
                self.graph
                    .task(dep)
                    .is_some_and(|t| t.status == TaskStatus::Pending)
                    && self.deps_compiled(*dep)
            })
            .collect();

        CompileStep {
            newly_eligible,
            failed: None,
        }
    }

    pub fn mark_failed(&mut self, key: TaskKey) -> CompileStep {
        if let Some(task) = self.graph.task_mut(&key) {
            warn!(package = %task.package.desc(), "compile task failed");
            task.status = TaskStatus::Failed;
        }
        CompileStep {
            newly_eligible: Vec::new(),
            failed: Some(key),
        }
    }

    /// Number of tasks that are neither compiled nor failed.
    pub fn unresolved(&self) -> usize {
        self.graph
            .tasks()
            .filter(|t| !t.status.is_terminal())
            .count()
    }
}

/// Read-only view for dependency checks.
pub struct ReadOnlyStateManager<'a> {
    graph: &'a CompileGraph,
}

impl<'a> ReadOnlyStateManager<'a> {
    pub fn new(graph: &'a CompileGraph) -> Self {
        Self { graph }
    }

    pub fn deps_compiled(&self, key: TaskKey) -> bool {
        self.graph
            .dependencies_of(key)
            .iter()
            .all(|dep| self.graph.task(dep).is_some_and(|t| t.is_compiled()))
    }
}
