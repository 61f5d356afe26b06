#![allow(dead_code)]

//! A director wired to the fakes, for end-to-end compile runs.

use std::sync::Arc;

use pkgcompile::config::ConfigFile;
use pkgcompile::engine::InMemoryLockBackend;
use pkgcompile::exec::{
    CompilationInstancePool, DynamicIpProvider, InstanceDeleter, InstanceReuser, IpProvider,
    ProvisionerSettings, VmCreator,
};
use pkgcompile::jobs::Job;
use pkgcompile::store::{InMemoryCompiledPackageStore, InMemoryVmStore};
use pkgcompile::{CompilationRun, Collaborators, prepare_compilation};

use crate::fakes::{FakeAgentConnector, FakeCloud};

pub const DEPLOYMENT: &str = "test-deployment";

pub struct Director {
    pub config: ConfigFile,
    pub cloud: Arc<FakeCloud>,
    pub agents: FakeAgentConnector,
    pub compiled_packages: Arc<InMemoryCompiledPackageStore>,
    pub vms: Arc<InMemoryVmStore>,
    pub locks: Arc<InMemoryLockBackend>,
}

impl Director {
    pub fn new(config: ConfigFile) -> Self {
        Self::with_agents(config, FakeAgentConnector::new())
    }

    pub fn with_agents(config: ConfigFile, agents: FakeAgentConnector) -> Self {
        Self {
            config,
            cloud: Arc::new(FakeCloud::new()),
            agents,
            compiled_packages: Arc::new(InMemoryCompiledPackageStore::new()),
            vms: Arc::new(InMemoryVmStore::new()),
            locks: Arc::new(InMemoryLockBackend::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            cloud: self.cloud.clone(),
            agents: Arc::new(self.agents.clone()),
            compiled_packages: self.compiled_packages.clone(),
            vms: self.vms.clone(),
            locks: self.locks.clone(),
        }
    }

    /// A compiler for `jobs` using this director's collaborators.
    pub fn compilation(&self, jobs: Vec<Arc<dyn Job>>) -> CompilationRun {
        prepare_compilation(&self.config, DEPLOYMENT, jobs, self.collaborators())
            .expect("compilation wiring failed")
    }

    pub fn ip_provider(&self) -> Arc<DynamicIpProvider> {
        let name = self.config.compilation.network_name.clone();
        let network = self
            .config
            .compilation_network()
            .cloned()
            .expect("compilation network configured");
        Arc::new(DynamicIpProvider::new(name, network))
    }

    pub fn vm_creator(&self) -> VmCreator {
        VmCreator::new(
            self.cloud.clone(),
            self.vms.clone(),
            Arc::new(self.agents.clone()),
            ProvisionerSettings::from(&self.config.director),
        )
    }

    /// A standalone pool, for exercising acquisition without a compiler.
    pub fn pool(&self, ip_provider: Arc<DynamicIpProvider>) -> CompilationInstancePool {
        let ips: Arc<dyn IpProvider> = ip_provider;
        let deleter = Arc::new(InstanceDeleter::new(
            self.cloud.clone(),
            self.vms.clone(),
            Arc::clone(&ips),
        ));
        CompilationInstancePool::new(
            Arc::new(InstanceReuser::new()),
            self.vm_creator(),
            deleter,
            ips,
            self.config.compilation.clone(),
            DEPLOYMENT,
        )
    }
}
