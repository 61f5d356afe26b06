// src/engine/worker.rs

//! Body of a single dispatched compile task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::CompilePackageRequest;
use crate::cloud::{Cloud, VmMetadata};
use crate::dag::{ScheduledCompile, TaskStatus};
use crate::engine::cache::GlobalCache;
use crate::engine::events::EventLog;
use crate::engine::lock::{CompileLock, LeaseStatus};
use crate::engine::{COMPILE_STAGE, WorkerEvent};
use crate::errors::{CompileError, Result};
use crate::exec::{CompilationInstancePool, Instance};
use crate::store::CompiledPackageStore;
use crate::types::{CompiledArtifact, CompiledPackage};

/// Where a task's compiled package came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Another director compiled it while we waited for the lock.
    Existing,
    /// Registered from the global cache.
    GlobalCache,
    /// Compiled by an agent during this run.
    Compiled,
}

#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub compiled: CompiledPackage,
    pub source: ArtifactSource,
}

/// Shared, read-only collaborators of every worker in a run.
pub(crate) struct WorkerContext {
    pub pool: Arc<CompilationInstancePool>,
    pub store: Arc<dyn CompiledPackageStore>,
    pub lock: Arc<CompileLock>,
    pub cloud: Arc<dyn Cloud>,
    pub cache: Option<Arc<dyn GlobalCache>>,
    pub events: Arc<dyn EventLog>,
    pub compile_timeout: Duration,
    pub status_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerContext {
    fn report(&self, task: &ScheduledCompile, status: TaskStatus) {
        // The receiver only goes away once the run is over.
        let _ = self.status_tx.send(WorkerEvent::StatusChanged {
            key: task.key,
            status,
        });
    }
}

/// Run one task and report it to the event log.
pub(crate) async fn run_worker(ctx: Arc<WorkerContext>, task: ScheduledCompile) -> Result<CompileOutcome> {
    let desc = task.desc();
    ctx.events.track_started(COMPILE_STAGE, &desc);

    let result = compile_task(&ctx, &task).await;

    match &result {
        Ok(outcome) => {
            debug!(package = %desc, source = ?outcome.source, "compile task finished");
            ctx.events.track_finished(COMPILE_STAGE, &desc, None);
        }
        Err(e) => {
            ctx.events
                .track_finished(COMPILE_STAGE, &desc, Some(e.to_string().as_str()));
        }
    }
    result
}

async fn compile_task(ctx: &WorkerContext, task: &ScheduledCompile) -> Result<CompileOutcome> {
    ctx.lock
        .with_compile_lock(task.package.id, task.stemcell.id, |lease| async move {
            ctx.report(task, TaskStatus::Locked);

            if let Some(existing) = ctx
                .store
                .find(task.package.id, &task.dependency_key, task.stemcell.id)
                .await?
            {
                info!(
                    package = %task.desc(),
                    stemcell = %task.stemcell.desc(),
                    "package compiled elsewhere while waiting for lock"
                );
                return Ok(CompileOutcome {
                    compiled: existing,
                    source: ArtifactSource::Existing,
                });
            }

            if let Some(cache) = &ctx.cache {
                if let Some(artifact) = lookup_global_cache(cache.as_ref(), task).await {
                    let compiled = register_artifact(ctx, task, artifact, &lease).await?;
                    info!(
                        package = %task.desc(),
                        stemcell = %task.stemcell.desc(),
                        "using compiled package from global cache"
                    );
                    return Ok(CompileOutcome {
                        compiled,
                        source: ArtifactSource::GlobalCache,
                    });
                }
            }

            let compiled = ctx
                .pool
                .with_vm(&task.stemcell, |instance| compile_on_instance(ctx, task, instance, &lease))
                .await?;

            if let Some(cache) = &ctx.cache {
                if let Err(e) = cache.save_to_global_cache(&compiled, &task.cache_key).await {
                    warn!(package = %task.desc(), error = %e, "failed to save compiled package to global cache");
                }
            }

            Ok::<_, CompileError>(CompileOutcome {
                compiled,
                source: ArtifactSource::Compiled,
            })
        })
        .await
}

/// Cache lookup; any failure counts as a miss.
async fn lookup_global_cache(cache: &dyn GlobalCache, task: &ScheduledCompile) -> Option<CompiledArtifact> {
    match cache.exists_in_global_cache(&task.package, &task.cache_key).await {
        Ok(true) => {}
        Ok(false) => return None,
        Err(e) => {
            warn!(package = %task.desc(), error = %e, "global cache lookup failed; compiling");
            return None;
        }
    }

    match cache.fetch_from_global_cache(&task.package, &task.cache_key).await {
        Ok(artifact) => artifact,
        Err(e) => {
            warn!(package = %task.desc(), error = %e, "global cache fetch failed; compiling");
            None
        }
    }
}

async fn register_artifact(
    ctx: &WorkerContext,
    task: &ScheduledCompile,
    artifact: CompiledArtifact,
    lease: &LeaseStatus,
) -> Result<CompiledPackage> {
    lease.ensure_held()?;
    let build = ctx.store.next_build(task.package.id, task.stemcell.id).await?;
    ctx.store
        .create(new_compiled_package(task, build, artifact))
        .await
}

async fn compile_on_instance(
    ctx: &WorkerContext,
    task: &ScheduledCompile,
    instance: Arc<Instance>,
    lease: &LeaseStatus,
) -> Result<CompiledPackage> {
    ctx.report(task, TaskStatus::Compiling);

    let agent = instance.agent()?;
    if let Some(cid) = instance.vm_cid() {
        let metadata = VmMetadata::from([("compiling".to_string(), task.package.name.clone())]);
        if let Err(e) = ctx.cloud.set_vm_metadata(&cid, &metadata).await {
            warn!(vm_cid = %cid, error = %e, "failed to tag compilation VM");
        }
    }

    let build = ctx.store.next_build(task.package.id, task.stemcell.id).await?;
    let request = CompilePackageRequest {
        blobstore_id: task.package.blobstore_id.clone(),
        sha1: task.package.sha1.clone(),
        name: task.package.name.clone(),
        version: format!("{}.{}", task.package.version, build),
        dependencies: task.dependencies.clone(),
    };

    info!(
        package = %task.desc(),
        stemcell = %task.stemcell.desc(),
        instance = %instance.id(),
        "compiling package"
    );

    let artifact = match tokio::time::timeout(ctx.compile_timeout, agent.compile_package(&request)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(CompileError::RpcTimeout {
                method: "compile_package".to_string(),
                agent_id: agent.agent_id().to_string(),
            });
        }
    };

    lease.ensure_held()?;
    ctx.store
        .create(new_compiled_package(task, build, artifact))
        .await
}

fn new_compiled_package(task: &ScheduledCompile, build: u32, artifact: CompiledArtifact) -> CompiledPackage {
    CompiledPackage {
        package_id: task.package.id,
        package_name: task.package.name.clone(),
        package_version: task.package.version.clone(),
        stemcell_id: task.stemcell.id,
        dependency_key: task.dependency_key.clone(),
        build,
        sha1: artifact.sha1,
        blobstore_id: artifact.blobstore_id,
    }
}
