// src/cloud.rs

//! Cloud provider interface (CPI) used to create and delete VMs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failures reported by a cloud provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// VM creation failed. `retryable` tells the caller whether another
    /// attempt may succeed.
    #[error("VM creation failed (retryable: {retryable}): {message}")]
    VmCreationFailed { retryable: bool, message: String },

    #[error("{0}")]
    Other(String),
}

/// Network settings sent to `create_vm`, keyed by network name.
pub type NetworkSettings = BTreeMap<String, Value>;

/// VM metadata tags.
pub type VmMetadata = BTreeMap<String, String>;

#[async_trait]
pub trait Cloud: Send + Sync {
    /// Create a VM and return its cid.
    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        cloud_properties: &Value,
        networks: &NetworkSettings,
        disk_cids: &[String],
        env: &Value,
    ) -> Result<String, CloudError>;

    async fn delete_vm(&self, vm_cid: &str) -> Result<(), CloudError>;

    async fn set_vm_metadata(&self, vm_cid: &str, metadata: &VmMetadata) -> Result<(), CloudError>;
}
