// src/exec/provisioner.rs

//! VM creation and agent bootstrap for compilation instances.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::agent::AgentConnector;
use crate::cloud::{Cloud, CloudError, VmMetadata};
use crate::config::DirectorSection;
use crate::errors::{CompileError, Result};
use crate::exec::instance::Instance;
use crate::store::{VmCredentials, VmRecord, VmStore};

/// Director settings the provisioner needs.
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    pub director_name: String,
    pub max_vm_create_tries: u32,
    pub encryption: bool,
    pub trusted_certs: String,
    pub agent_wait_timeout: Duration,
}

impl From<&DirectorSection> for ProvisionerSettings {
    fn from(director: &DirectorSection) -> Self {
        Self {
            director_name: director.name.clone(),
            max_vm_create_tries: director.max_vm_create_tries,
            encryption: director.encryption,
            trusted_certs: director.trusted_certs.clone(),
            agent_wait_timeout: director.agent_wait_timeout(),
        }
    }
}

/// Creates VMs through the cloud and brings their agents up.
pub struct VmCreator {
    cloud: Arc<dyn Cloud>,
    vm_store: Arc<dyn VmStore>,
    connector: Arc<dyn AgentConnector>,
    settings: ProvisionerSettings,
}

impl VmCreator {
    pub fn new(
        cloud: Arc<dyn Cloud>,
        vm_store: Arc<dyn VmStore>,
        connector: Arc<dyn AgentConnector>,
        settings: ProvisionerSettings,
    ) -> Self {
        Self {
            cloud,
            vm_store,
            connector,
            settings,
        }
    }

    /// Create a VM for `instance`, bind it and bootstrap its agent.
    ///
    /// The VM is bound to the instance as soon as it is persisted, so when a
    /// later bootstrap step fails the caller's teardown deletes it.
    pub async fn create_for_instance(&self, instance: &Instance, disk_cids: &[String]) -> Result<()> {
        let agent_id = uuid::Uuid::new_v4().to_string();
        let (cid, credentials) = self.create_with_retries(instance, &agent_id, disk_cids).await?;

        let record = VmRecord {
            cid: cid.clone(),
            agent_id,
            instance_id: instance.id().to_string(),
            credentials,
        };
        let record = match self.vm_store.create(record).await {
            Ok(record) => record,
            Err(e) => {
                if let Err(delete_err) = self.cloud.delete_vm(&cid).await {
                    warn!(vm_cid = %cid, error = %delete_err, "failed to delete unrecorded VM");
                }
                return Err(e);
            }
        };
        instance.bind_vm(record.clone());
        info!(vm_cid = %cid, instance = %instance.id(), stemcell = %instance.stemcell().desc(), "created compilation VM");

        self.set_metadata(instance, &cid).await;
        self.bootstrap_agent(instance, &record).await
    }

    async fn create_with_retries(
        &self,
        instance: &Instance,
        agent_id: &str,
        disk_cids: &[String],
    ) -> Result<(String, Option<VmCredentials>)> {
        let spec = instance.spec();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let mut env = spec.env.clone();
            let credentials = if self.settings.encryption {
                let credentials = generate_credentials();
                inject_credentials(&mut env, &credentials);
                Some(credentials)
            } else {
                None
            };

            let result = self
                .cloud
                .create_vm(
                    agent_id,
                    &instance.stemcell().cid,
                    &spec.cloud_properties,
                    &spec.networks,
                    disk_cids,
                    &env,
                )
                .await;

            match result {
                Ok(cid) => return Ok((cid, credentials)),
                Err(CloudError::VmCreationFailed {
                    retryable: true,
                    message,
                }) if attempt < self.settings.max_vm_create_tries => {
                    warn!(
                        attempt,
                        max_tries = self.settings.max_vm_create_tries,
                        error = %message,
                        "VM creation failed; retrying"
                    );
                }
                Err(e) => {
                    error!(attempt, error = %e, "VM creation failed");
                    return Err(CompileError::from(e));
                }
            }
        }
    }

    async fn set_metadata(&self, instance: &Instance, cid: &str) {
        let metadata = VmMetadata::from([
            ("deployment".to_string(), instance.spec().deployment.clone()),
            ("job".to_string(), instance.job_name().to_string()),
            ("index".to_string(), instance.index().to_string()),
            ("director".to_string(), self.settings.director_name.clone()),
            ("id".to_string(), instance.id().to_string()),
        ]);
        if let Err(e) = self.cloud.set_vm_metadata(cid, &metadata).await {
            warn!(vm_cid = %cid, error = %e, "failed to set VM metadata");
        }
    }

    async fn bootstrap_agent(&self, instance: &Instance, record: &VmRecord) -> Result<()> {
        let agent = self.connector.connect(record);
        instance.attach_agent(Arc::clone(&agent));

        debug!(agent_id = %record.agent_id, vm_cid = %record.cid, "waiting for agent");
        match tokio::time::timeout(self.settings.agent_wait_timeout, agent.wait_until_ready()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CompileError::RpcTimeout {
                    method: "wait_until_ready".to_string(),
                    agent_id: record.agent_id.clone(),
                });
            }
        }

        agent.apply(&instance.apply_spec()).await?;
        agent.update_settings(&self.settings.trusted_certs).await?;
        debug!(agent_id = %record.agent_id, "agent ready");
        Ok(())
    }
}

fn generate_credentials() -> VmCredentials {
    VmCredentials {
        crypt_key: random_key(),
        sign_key: random_key(),
    }
}

fn random_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Put credentials under `bosh.credentials` in the agent env.
fn inject_credentials(env: &mut Value, credentials: &VmCredentials) {
    if !env.is_object() {
        *env = Value::Object(Map::new());
    }
    let Some(root) = env.as_object_mut() else {
        return;
    };
    let bosh = root
        .entry("bosh")
        .or_insert_with(|| Value::Object(Map::new()));
    if !bosh.is_object() {
        *bosh = Value::Object(Map::new());
    }
    if let Some(bosh) = bosh.as_object_mut() {
        let mut creds = Map::new();
        creds.insert("crypt_key".to_string(), Value::String(credentials.crypt_key.clone()));
        creds.insert("sign_key".to_string(), Value::String(credentials.sign_key.clone()));
        bosh.insert("credentials".to_string(), Value::Object(creds));
    }
}
