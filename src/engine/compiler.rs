// src/engine/compiler.rs

//! The package compilation control loop.
//!
//! The graph and all status transitions stay on the control loop; workers
//! only see [`ScheduledCompile`] snapshots and report back through a
//! channel and their join handles.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cloud::Cloud;
use crate::config::{CompilationConfig, DirectorSection};
use crate::dag::{CompileGraph, ScheduledCompile, StateManager, TaskKey};
use crate::engine::cache::GlobalCache;
use crate::engine::events::{EventLog, TracingEventLog};
use crate::engine::lock::CompileLock;
use crate::engine::progress::DirectorTask;
use crate::engine::worker::{ArtifactSource, CompileOutcome, WorkerContext, run_worker};
use crate::engine::{COMPILE_STAGE, WorkerEvent};
use crate::errors::{CompileError, Result};
use crate::exec::CompilationInstancePool;
use crate::jobs::Job;
use crate::store::CompiledPackageStore;

type WorkerResult = (TaskKey, Result<CompileOutcome>);

/// Compiles every package the given jobs need, for each job's stemcell.
pub struct PackageCompiler {
    jobs: Vec<Arc<dyn Job>>,
    config: CompilationConfig,
    pool: Arc<CompilationInstancePool>,
    store: Arc<dyn CompiledPackageStore>,
    lock: Arc<CompileLock>,
    cloud: Arc<dyn Cloud>,
    compile_timeout: Duration,
    use_global_cache: bool,
    cache: Option<Arc<dyn GlobalCache>>,
    events: Arc<dyn EventLog>,
    director_task: Option<Arc<dyn DirectorTask>>,

    compile_tasks_count: usize,
    compilations_performed: usize,
}

impl PackageCompiler {
    pub fn new(
        jobs: Vec<Arc<dyn Job>>,
        director: &DirectorSection,
        config: CompilationConfig,
        pool: Arc<CompilationInstancePool>,
        store: Arc<dyn CompiledPackageStore>,
        lock: Arc<CompileLock>,
        cloud: Arc<dyn Cloud>,
    ) -> Self {
        Self {
            jobs,
            config,
            pool,
            store,
            lock,
            cloud,
            compile_timeout: director.compile_timeout(),
            use_global_cache: director.use_compiled_package_cache,
            cache: None,
            events: Arc::new(TracingEventLog),
            director_task: None,
            compile_tasks_count: 0,
            compilations_performed: 0,
        }
    }

    /// Install the global cache. Only consulted when
    /// `use_compiled_package_cache` is enabled.
    pub fn with_global_cache(mut self, cache: Arc<dyn GlobalCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_event_log(mut self, events: Arc<dyn EventLog>) -> Self {
        self.events = events;
        self
    }

    pub fn with_director_task(mut self, task: Arc<dyn DirectorTask>) -> Self {
        self.director_task = Some(task);
        self
    }

    /// Distinct `(package, stemcell)` pairs seen by the last run.
    pub fn compile_tasks_count(&self) -> usize {
        self.compile_tasks_count
    }

    /// Compile RPCs that produced a package in the last run.
    pub fn compilations_performed(&self) -> usize {
        self.compilations_performed
    }

    /// Compile everything the jobs need.
    ///
    /// Returns the first error any task hit. Cancellation is not an error.
    /// The instance pool is drained before returning in every case.
    pub async fn perform(&mut self) -> Result<()> {
        self.compilations_performed = 0;

        let mut graph = CompileGraph::build(&self.jobs)?;
        self.compile_tasks_count = graph.len();
        info!(tasks = graph.len(), "compile graph ready");

        self.resolve_existing(&mut graph).await?;

        let pending = StateManager::new(&mut graph).unresolved();
        if pending == 0 {
            info!("all packages already compiled");
            return Ok(());
        }

        self.events.begin_stage(COMPILE_STAGE, pending);
        let result = self.run(&mut graph).await;

        let drained = self.pool.delete_instances(self.config.workers).await;
        match (result, drained) {
            (Ok(()), drained) => drained,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(drain_err)) => {
                warn!(error = %drain_err, "failed to clean up compilation instances");
                Err(e)
            }
        }
    }

    /// Mark tasks that already have a compiled package, without provisioning.
    async fn resolve_existing(&self, graph: &mut CompileGraph) -> Result<()> {
        for key in graph.keys().to_vec() {
            let Some(task) = graph.task(&key) else {
                continue;
            };
            let found = self
                .store
                .find(task.package.id, &task.dependency_key, task.stemcell.id)
                .await?;
            if let Some(compiled) = found {
                debug!(
                    package = %task.package.desc(),
                    stemcell = %task.stemcell.desc(),
                    build = compiled.build,
                    "found compiled package"
                );
                StateManager::new(graph).mark_compiled(key, compiled);
            }
        }
        Ok(())
    }

    async fn run(&mut self, graph: &mut CompileGraph) -> Result<()> {
        let workers = self.config.workers.max(1);
        let (status_tx, mut status_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let ctx = Arc::new(WorkerContext {
            pool: Arc::clone(&self.pool),
            store: Arc::clone(&self.store),
            lock: Arc::clone(&self.lock),
            cloud: Arc::clone(&self.cloud),
            cache: if self.use_global_cache {
                self.cache.clone()
            } else {
                None
            },
            events: Arc::clone(&self.events),
            compile_timeout: self.compile_timeout,
            status_tx,
        });

        let mut in_flight: JoinSet<WorkerResult> = JoinSet::new();
        let mut first_error: Option<CompileError> = None;
        let mut cancelled = false;

        loop {
            apply_worker_events(graph, &mut status_rx);

            if first_error.is_none() && !cancelled && in_flight.len() < workers {
                if self.is_cancelled() {
                    info!(in_flight = in_flight.len(), "compilation cancelled; waiting for running tasks");
                    cancelled = true;
                } else {
                    let ready = StateManager::new(graph).collect_ready(workers - in_flight.len());
                    if !ready.is_empty() {
                        match self.checkpoint() {
                            Ok(()) => self.dispatch(&ctx, &mut in_flight, ready),
                            Err(e) => {
                                for task in &ready {
                                    StateManager::new(graph).mark_failed(task.key);
                                }
                                first_error = Some(e);
                            }
                        }
                    }
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            apply_worker_events(graph, &mut status_rx);

            let (key, result) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    first_error.get_or_insert(CompileError::Other(join_err.into()));
                    continue;
                }
            };

            match result {
                Ok(outcome) => {
                    if outcome.source == ArtifactSource::Compiled {
                        self.compilations_performed += 1;
                    }
                    let step = StateManager::new(graph).mark_compiled(key, outcome.compiled);
                    debug!(task = %key, newly_eligible = step.newly_eligible.len(), "task compiled");
                }
                Err(e) => {
                    StateManager::new(graph).mark_failed(key);
                    if first_error.is_none() {
                        warn!(task = %key, error = %e, "compile task failed; aborting run");
                        first_error = Some(e);
                    } else {
                        warn!(task = %key, error = %e, "compile task failed");
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancelled {
            return Ok(());
        }

        let unresolved = StateManager::new(graph).unresolved();
        if unresolved > 0 {
            return Err(CompileError::Other(anyhow::anyhow!(
                "{unresolved} compile tasks could not be scheduled"
            )));
        }
        info!(compiled = self.compilations_performed, "compilation finished");
        Ok(())
    }

    fn dispatch(&self, ctx: &Arc<WorkerContext>, in_flight: &mut JoinSet<WorkerResult>, ready: Vec<ScheduledCompile>) {
        debug!(count = ready.len(), "dispatching compile tasks");
        for task in ready {
            let ctx = Arc::clone(ctx);
            in_flight.spawn(async move {
                let key = task.key;
                (key, run_worker(ctx, task).await)
            });
        }
    }

    fn is_cancelled(&self) -> bool {
        self.director_task
            .as_ref()
            .is_some_and(|task| task.task_cancelled())
    }

    fn checkpoint(&self) -> Result<()> {
        match &self.director_task {
            Some(task) => task.task_checkpoint(),
            None => Ok(()),
        }
    }
}

fn apply_worker_events(graph: &mut CompileGraph, rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Ok(event) = rx.try_recv() {
        match event {
            WorkerEvent::StatusChanged { key, status } => {
                StateManager::new(graph).mark_status(key, status);
            }
        }
    }
}
