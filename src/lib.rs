// src/lib.rs

pub mod agent;
pub mod cloud;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod jobs;
pub mod logging;
pub mod release;
pub mod store;
pub mod types;

use std::sync::Arc;

use tracing::debug;

use crate::agent::AgentConnector;
use crate::cloud::Cloud;
use crate::config::ConfigFile;
use crate::engine::{CompileLock, LockBackend, PackageCompiler};
use crate::errors::{CompileError, Result};
use crate::exec::{
    CompilationInstancePool, DynamicIpProvider, InstanceDeleter, InstanceReuser, IpProvider,
    ProvisionerSettings, VmCreator,
};
use crate::jobs::Job;
use crate::store::{CompiledPackageStore, VmStore};

/// External systems a compilation run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub cloud: Arc<dyn Cloud>,
    pub agents: Arc<dyn AgentConnector>,
    pub compiled_packages: Arc<dyn CompiledPackageStore>,
    pub vms: Arc<dyn VmStore>,
    pub locks: Arc<dyn LockBackend>,
}

/// A compiler wired to its instance pool.
pub struct CompilationRun {
    pub compiler: PackageCompiler,
    pub pool: Arc<CompilationInstancePool>,
    pub ip_provider: Arc<DynamicIpProvider>,
}

/// High-level entry point: wire a [`PackageCompiler`] for `jobs` of
/// `deployment` from a validated config.
///
/// This wires together:
/// - the dynamic network reservations on the compilation network
/// - the VM provisioner and instance deleter
/// - the instance pool and its reuser
/// - the compile lock
///
/// The global cache, event log and director task hooks are installed by
/// the caller on `CompilationRun::compiler`.
pub fn prepare_compilation(
    cfg: &ConfigFile,
    deployment: &str,
    jobs: Vec<Arc<dyn Job>>,
    collaborators: Collaborators,
) -> Result<CompilationRun> {
    let network = cfg.compilation_network().ok_or_else(|| {
        CompileError::Config(format!(
            "[compilation] refers to unknown network '{}'",
            cfg.compilation.network_name
        ))
    })?;

    let ip_provider = Arc::new(DynamicIpProvider::new(
        cfg.compilation.network_name.clone(),
        network.clone(),
    ));
    let ips: Arc<dyn IpProvider> = ip_provider.clone();

    let vm_creator = VmCreator::new(
        Arc::clone(&collaborators.cloud),
        Arc::clone(&collaborators.vms),
        Arc::clone(&collaborators.agents),
        ProvisionerSettings::from(&cfg.director),
    );
    let deleter = Arc::new(InstanceDeleter::new(
        Arc::clone(&collaborators.cloud),
        Arc::clone(&collaborators.vms),
        Arc::clone(&ips),
    ));
    let pool = Arc::new(CompilationInstancePool::new(
        Arc::new(InstanceReuser::new()),
        vm_creator,
        deleter,
        ips,
        cfg.compilation.clone(),
        deployment,
    ));

    let owner = format!("{}/{}", cfg.director.name, uuid::Uuid::new_v4());
    let lock = Arc::new(CompileLock::new(
        collaborators.locks,
        owner,
        cfg.director.lock_timeout(),
        cfg.director.lock_lease(),
    ));

    debug!(
        deployment = %deployment,
        workers = cfg.compilation.workers,
        reuse = ?cfg.compilation.reuse_policy(),
        "compilation wired"
    );

    let compiler = PackageCompiler::new(
        jobs,
        &cfg.director,
        cfg.compilation.clone(),
        Arc::clone(&pool),
        collaborators.compiled_packages,
        lock,
        collaborators.cloud,
    );

    Ok(CompilationRun {
        compiler,
        pool,
        ip_provider,
    })
}
