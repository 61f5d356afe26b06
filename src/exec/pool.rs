// src/exec/pool.rs

//! Acquisition of compilation instances.
//!
//! Both acquisition modes are scoped: the caller's future runs with the
//! instance, and the pool decides afterwards whether the instance goes back
//! to the idle set or is torn down.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::CompilationConfig;
use crate::errors::{CompileError, Result};
use crate::exec::deleter::InstanceDeleter;
use crate::exec::instance::{Instance, InstanceSpec};
use crate::exec::network::IpProvider;
use crate::exec::provisioner::VmCreator;
use crate::exec::reuser::InstanceReuser;
use crate::types::{Stemcell, VmReusePolicy};

pub struct CompilationInstancePool {
    reuser: Arc<InstanceReuser>,
    vm_creator: VmCreator,
    deleter: Arc<InstanceDeleter>,
    ip_provider: Arc<dyn IpProvider>,
    config: CompilationConfig,
    deployment: String,
}

impl CompilationInstancePool {
    pub fn new(
        reuser: Arc<InstanceReuser>,
        vm_creator: VmCreator,
        deleter: Arc<InstanceDeleter>,
        ip_provider: Arc<dyn IpProvider>,
        config: CompilationConfig,
        deployment: impl Into<String>,
    ) -> Self {
        Self {
            reuser,
            vm_creator,
            deleter,
            ip_provider,
            config,
            deployment: deployment.into(),
        }
    }

    pub fn reuser(&self) -> &Arc<InstanceReuser> {
        &self.reuser
    }

    pub fn reuse_policy(&self) -> VmReusePolicy {
        self.config.reuse_policy()
    }

    /// Run `f` on an instance chosen according to the configured policy.
    pub async fn with_vm<F, Fut, T>(&self, stemcell: &Stemcell, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Instance>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.reuse_policy() {
            VmReusePolicy::Reuse => self.with_reused_vm(stemcell, f).await,
            VmReusePolicy::SingleUse => self.with_single_use_vm(stemcell, f).await,
        }
    }

    /// Run `f` on an idle instance for `stemcell`, creating one if none is
    /// idle. The instance returns to the idle set only if `f` succeeds; on
    /// any failure it is unregistered and deleted.
    pub async fn with_reused_vm<F, Fut, T>(&self, stemcell: &Stemcell, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Instance>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let instance = match self.reuser.get_instance(stemcell) {
            Some(instance) => instance,
            None => {
                let instance = self.create_instance(stemcell)?;
                self.reuser.add_in_use_instance(Arc::clone(&instance));
                if let Err(e) = self.vm_creator.create_for_instance(&instance, &[]).await {
                    self.discard(&instance).await;
                    return Err(e);
                }
                instance
            }
        };

        match f(Arc::clone(&instance)).await {
            Ok(value) => {
                self.reuser.release_instance(&instance);
                Ok(value)
            }
            Err(e) => {
                self.discard(&instance).await;
                Err(e)
            }
        }
    }

    /// Run `f` on a freshly created instance and delete it afterwards.
    ///
    /// An error from `f` takes precedence over a teardown error.
    pub async fn with_single_use_vm<F, Fut, T>(&self, stemcell: &Stemcell, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Instance>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let instance = self.create_instance(stemcell)?;

        let result = match self.vm_creator.create_for_instance(&instance, &[]).await {
            Ok(()) => f(Arc::clone(&instance)).await,
            Err(e) => Err(e),
        };

        let teardown = self.deleter.delete_instance(&instance).await;
        match (result, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_err)) => {
                warn!(instance = %instance.id(), error = %teardown_err, "failed to delete single-use instance");
                Err(e)
            }
        }
    }

    /// Delete every pooled instance, at most `concurrency` at a time.
    ///
    /// All deletions are attempted; the first failure is returned.
    pub async fn delete_instances(&self, concurrency: usize) -> Result<()> {
        let instances = self.reuser.instances();
        if instances.is_empty() {
            return Ok(());
        }
        info!(count = instances.len(), concurrency, "deleting compilation instances");

        let limit = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut set = JoinSet::new();

        for instance in instances {
            let limit = Arc::clone(&limit);
            let deleter = Arc::clone(&self.deleter);
            let reuser = Arc::clone(&self.reuser);
            set.spawn(async move {
                let _permit = limit
                    .acquire_owned()
                    .await
                    .map_err(|e| CompileError::Other(e.into()))?;
                deleter.delete_instance(&instance).await?;
                reuser.remove_instance(&instance);
                Ok::<(), CompileError>(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = joined.map_err(|e| CompileError::Other(e.into())).and_then(|r| r);
            if let Err(e) = result {
                warn!(error = %e, "failed to delete compilation instance");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn create_instance(&self, stemcell: &Stemcell) -> Result<Arc<Instance>> {
        let id = uuid::Uuid::new_v4().to_string();
        let reservation = self.ip_provider.reserve(&id)?;
        let spec = InstanceSpec {
            deployment: self.deployment.clone(),
            cloud_properties: self.config.cloud_properties.clone(),
            env: self.config.env.clone(),
            networks: self.ip_provider.network_settings(&reservation),
            availability_zone: self.config.availability_zone.clone(),
        };
        debug!(instance = %id, stemcell = %stemcell.desc(), "created compilation instance");
        Ok(Arc::new(Instance::new(id, stemcell.clone(), spec, reservation)))
    }

    /// Unregister a broken instance and tear it down.
    async fn discard(&self, instance: &Instance) {
        self.reuser.remove_instance(instance);
        if let Err(e) = self.deleter.delete_instance(instance).await {
            warn!(instance = %instance.id(), error = %e, "failed to delete broken instance");
        }
    }
}
