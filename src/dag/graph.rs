// src/dag/graph.rs

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info};

use crate::dag::keys;
use crate::dag::task_info::{CompileTask, TaskKey};
use crate::errors::{CompileError, Result};
use crate::jobs::Job;
use crate::release::ReleaseVersion;
use crate::types::{Package, Stemcell};

/// Compile tasks for a set of jobs, with dependency edges between tasks of
/// the same stemcell.
///
/// Edge direction: dependency -> dependent. For `ruby` depending on
/// `common` we add `common -> ruby`.
#[derive(Debug, Default)]
pub struct CompileGraph {
    tasks: HashMap<TaskKey, CompileTask>,
    edges: DiGraphMap<TaskKey, ()>,
    /// Topological order of all tasks; used to make dispatch order stable.
    order: Vec<TaskKey>,
}

impl CompileGraph {
    /// Build one compile task per distinct `(package, stemcell)` pair needed
    /// by `jobs`, including every transitive dependency.
    ///
    /// Fails before anything is provisioned if a package names a dependency
    /// that the release does not contain.
    pub fn build(jobs: &[Arc<dyn Job>]) -> Result<Self> {
        let mut graph = CompileGraph::default();

        for job in jobs {
            let stemcell = job.stemcell();

            let mut template_descs: Vec<String> = job
                .templates()
                .iter()
                .map(|t| format!("`{}'", t.desc()))
                .collect();
            template_descs.sort();
            template_descs.dedup();
            info!(
                job = %job.name(),
                "Job templates {} need to run on stemcell `{}'",
                template_descs.join(", "),
                stemcell.desc()
            );

            for template in job.templates() {
                let template_desc = template.desc();
                for package in template.package_models() {
                    let key = graph.add_task(job, template.release(), package, stemcell)?;
                    if let Some(task) = graph.tasks.get_mut(&key) {
                        task.templates.insert(template_desc.clone());
                    }
                }
            }
        }

        graph.order = match toposort(&graph.edges, None) {
            Ok(order) => order,
            Err(cycle) => {
                let key = cycle.node_id();
                let name = graph
                    .tasks
                    .get(&key)
                    .map(|t| t.package.name.clone())
                    .unwrap_or_else(|| key.to_string());
                return Err(CompileError::DependencyCycle(format!(
                    "cycle detected in compile graph involving package '{name}'"
                )));
            }
        };

        debug!(tasks = graph.tasks.len(), "compile graph built");
        Ok(graph)
    }

    /// Ensure a task exists for `package` on `stemcell` (and for all of its
    /// dependencies), and attach `job` to it and to its whole closure.
    fn add_task(
        &mut self,
        job: &Arc<dyn Job>,
        release: &ReleaseVersion,
        package: &Arc<Package>,
        stemcell: &Stemcell,
    ) -> Result<TaskKey> {
        let key = TaskKey::new(package.id, stemcell.id);

        if !self.tasks.contains_key(&key) {
            let transitive = release.transitive_dependencies(package)?;
            let dependency_key = keys::dependency_key(&transitive);
            let cache_key = keys::cache_key(package, &dependency_key, stemcell);

            debug!(
                package = %package.desc(),
                stemcell = %stemcell.desc(),
                dependency_key = %dependency_key,
                "adding compile task"
            );

            self.tasks.insert(
                key,
                CompileTask::new(Arc::clone(package), stemcell.clone(), dependency_key, cache_key),
            );
            self.edges.add_node(key);

            for dep in release.dependencies(package)? {
                let dep_key = self.add_task(job, release, &dep, stemcell)?;
                self.edges.add_edge(dep_key, key, ());
            }
        }

        self.attach_job_to_closure(key, job);
        Ok(key)
    }

    /// Attach `job` to `root` and every task `root` transitively depends on.
    fn attach_job_to_closure(&mut self, root: TaskKey, job: &Arc<dyn Job>) {
        let mut stack = vec![root];
        while let Some(key) = stack.pop() {
            if let Some(task) = self.tasks.get_mut(&key) {
                task.add_job(job);
            }
            stack.extend(self.edges.neighbors_directed(key, Direction::Incoming));
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, key: &TaskKey) -> Option<&CompileTask> {
        self.tasks.get(key)
    }

    pub fn task_mut(&mut self, key: &TaskKey) -> Option<&mut CompileTask> {
        self.tasks.get_mut(key)
    }

    /// Tasks in topological order (dependencies first).
    pub fn tasks(&self) -> impl Iterator<Item = &CompileTask> {
        self.order.iter().filter_map(|key| self.tasks.get(key))
    }

    /// Keys in topological order.
    pub fn keys(&self) -> &[TaskKey] {
        &self.order
    }

    /// Direct dependencies of a task.
    pub fn dependencies_of(&self, key: TaskKey) -> Vec<TaskKey> {
        self.edges
            .neighbors_directed(key, Direction::Incoming)
            .collect()
    }

    /// Direct dependents of a task.
    pub fn dependents_of(&self, key: TaskKey) -> Vec<TaskKey> {
        self.edges
            .neighbors_directed(key, Direction::Outgoing)
            .collect()
    }
}
