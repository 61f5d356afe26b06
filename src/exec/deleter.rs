// src/exec/deleter.rs

use std::sync::Arc;

use tracing::info;

use crate::cloud::Cloud;
use crate::errors::Result;
use crate::exec::instance::Instance;
use crate::exec::network::IpProvider;
use crate::store::VmStore;

/// Tears down compilation instances: VM, VM record, network reservation.
pub struct InstanceDeleter {
    cloud: Arc<dyn Cloud>,
    vm_store: Arc<dyn VmStore>,
    ip_provider: Arc<dyn IpProvider>,
}

impl InstanceDeleter {
    pub fn new(cloud: Arc<dyn Cloud>, vm_store: Arc<dyn VmStore>, ip_provider: Arc<dyn IpProvider>) -> Self {
        Self {
            cloud,
            vm_store,
            ip_provider,
        }
    }

    /// Delete the instance's VM (if one was bound) and release its address.
    ///
    /// If the cloud refuses to delete the VM, the record and reservation are
    /// kept and the error is returned.
    pub async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        if let Some(vm) = instance.vm() {
            info!(vm_cid = %vm.cid, instance = %instance.id(), "deleting compilation VM");
            self.cloud.delete_vm(&vm.cid).await?;
            self.vm_store.delete(&vm.cid).await?;
            instance.unbind_vm();
        }
        self.ip_provider.release(instance.reservation());
        Ok(())
    }
}
