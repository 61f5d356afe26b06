// src/dag/task_info.rs

//! Compile tasks and their per-run state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::jobs::Job;
use crate::types::{CompiledPackage, Package, PackageDescriptor, PackageId, Stemcell, StemcellId};

/// Identity of a compile task: one package on one stemcell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub package_id: PackageId,
    pub stemcell_id: StemcellId,
}

impl TaskKey {
    pub fn new(package_id: PackageId, stemcell_id: StemcellId) -> Self {
        Self {
            package_id,
            stemcell_id,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "package {} / stemcell {}", self.package_id, self.stemcell_id)
    }
}

/// Lifecycle of a compile task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies compiled; handed to a worker.
    Ready,
    /// Worker holds the compile lock.
    Locked,
    /// Compile RPC issued on an instance.
    Compiling,
    /// A compiled package exists for this task.
    Compiled,
    /// The worker for this task returned an error.
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Compiled | TaskStatus::Failed)
    }
}

/// A node in the compile graph.
#[derive(Debug, Clone)]
pub struct CompileTask {
    pub key: TaskKey,
    pub package: Arc<Package>,
    pub stemcell: Stemcell,
    pub dependency_key: String,
    pub cache_key: String,
    pub status: TaskStatus,
    /// Jobs to notify once the package is compiled.
    pub jobs: Vec<Arc<dyn Job>>,
    /// `release/template` names requiring this package (diagnostics only).
    pub templates: BTreeSet<String>,
    pub compiled_package: Option<CompiledPackage>,
}

impl CompileTask {
    pub fn new(
        package: Arc<Package>,
        stemcell: Stemcell,
        dependency_key: String,
        cache_key: String,
    ) -> Self {
        Self {
            key: TaskKey::new(package.id, stemcell.id),
            package,
            stemcell,
            dependency_key,
            cache_key,
            status: TaskStatus::Pending,
            jobs: Vec::new(),
            templates: BTreeSet::new(),
            compiled_package: None,
        }
    }

    /// Attach a consumer job; each job is kept once.
    pub fn add_job(&mut self, job: &Arc<dyn Job>) {
        if !self.jobs.iter().any(|j| Arc::ptr_eq(j, job)) {
            self.jobs.push(Arc::clone(job));
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled_package.is_some()
    }

    /// Record the compiled package and notify every consumer job.
    pub fn use_compiled_package(&mut self, compiled_package: CompiledPackage) {
        for job in &self.jobs {
            job.use_compiled_package(&compiled_package);
        }
        self.compiled_package = Some(compiled_package);
        self.status = TaskStatus::Compiled;
    }
}

/// What a worker needs to compile one task.
///
/// A self-contained snapshot so the worker never touches the graph.
#[derive(Debug, Clone)]
pub struct ScheduledCompile {
    pub key: TaskKey,
    pub package: Arc<Package>,
    pub stemcell: Stemcell,
    pub dependency_key: String,
    pub cache_key: String,
    /// Immediate (not transitive) compiled dependencies, keyed by name.
    pub dependencies: BTreeMap<String, PackageDescriptor>,
}

impl ScheduledCompile {
    pub fn desc(&self) -> String {
        format!("{}/{}", self.package.name, self.package.version)
    }
}
