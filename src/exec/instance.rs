// src/exec/instance.rs

//! Compilation instances.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};

use crate::agent::AgentClient;
use crate::cloud::NetworkSettings;
use crate::errors::{CompileError, Result};
use crate::exec::network::NetworkReservation;
use crate::store::VmRecord;
use crate::types::Stemcell;

/// What a compilation VM should look like.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub deployment: String,
    pub cloud_properties: Value,
    pub env: Value,
    pub networks: NetworkSettings,
    pub availability_zone: Option<String>,
}

/// A throwaway instance of a `compilation-<uuid>` job bound to one stemcell.
///
/// The VM is bound after creation; until then the instance is a placeholder
/// holding only its network reservation.
pub struct Instance {
    id: String,
    job_name: String,
    stemcell: Stemcell,
    spec: InstanceSpec,
    reservation: NetworkReservation,
    vm: Mutex<Option<VmRecord>>,
    agent: Mutex<Option<Arc<dyn AgentClient>>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("job_name", &self.job_name)
            .field("stemcell", &self.stemcell.desc())
            .field("vm", &self.vm_cid())
            .finish()
    }
}

impl Instance {
    pub fn new(id: impl Into<String>, stemcell: Stemcell, spec: InstanceSpec, reservation: NetworkReservation) -> Self {
        let id = id.into();
        Self {
            job_name: format!("compilation-{id}"),
            id,
            stemcell,
            spec,
            reservation,
            vm: Mutex::new(None),
            agent: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Compilation jobs always have a single instance.
    pub fn index(&self) -> u32 {
        0
    }

    pub fn stemcell(&self) -> &Stemcell {
        &self.stemcell
    }

    pub fn spec(&self) -> &InstanceSpec {
        &self.spec
    }

    pub fn reservation(&self) -> &NetworkReservation {
        &self.reservation
    }

    pub fn bind_vm(&self, record: VmRecord) {
        *self.vm.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);
    }

    /// Detach the VM (and its agent) from the instance.
    pub fn unbind_vm(&self) -> Option<VmRecord> {
        self.agent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.vm.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn vm(&self) -> Option<VmRecord> {
        self.vm.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn vm_cid(&self) -> Option<String> {
        self.vm().map(|vm| vm.cid)
    }

    pub fn attach_agent(&self, agent: Arc<dyn AgentClient>) {
        *self.agent.lock().unwrap_or_else(PoisonError::into_inner) = Some(agent);
    }

    /// Agent of the bound VM.
    pub fn agent(&self) -> Result<Arc<dyn AgentClient>> {
        self.agent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CompileError::InstanceNotProvisioned(self.id.clone()))
    }

    /// Initial state applied to a freshly bootstrapped agent.
    pub fn apply_spec(&self) -> Value {
        json!({
            "deployment": self.spec.deployment,
            "job": { "name": self.job_name, "templates": [] },
            "index": self.index(),
            "id": self.id,
            "az": self.spec.availability_zone,
            "networks": self.spec.networks,
            "vm_type": {
                "name": self.job_name,
                "cloud_properties": self.spec.cloud_properties,
            },
            "stemcell": {
                "name": self.stemcell.name,
                "version": self.stemcell.version,
            },
            "env": self.spec.env,
            "packages": {},
        })
    }
}
