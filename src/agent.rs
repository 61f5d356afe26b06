// src/agent.rs

//! RPC surface of the agent running on each provisioned VM.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::errors::Result;
use crate::store::VmRecord;
use crate::types::{CompiledArtifact, PackageDescriptor};

/// Arguments of the `compile_package` RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilePackageRequest {
    /// Blobstore id of the package source.
    pub blobstore_id: String,
    /// SHA1 of the package source.
    pub sha1: String,
    pub name: String,
    /// `<package version>.<build>`.
    pub version: String,
    /// Immediate dependencies, keyed by package name.
    pub dependencies: BTreeMap<String, PackageDescriptor>,
}

/// Client for one VM's agent.
///
/// Implementations return `CompileError::Agent` for RPC-level failures and
/// `CompileError::RpcTimeout` when the agent does not answer.
#[async_trait]
pub trait AgentClient: Send + Sync {
    fn agent_id(&self) -> &str;

    async fn wait_until_ready(&self) -> Result<()>;

    async fn update_settings(&self, trusted_certs: &str) -> Result<()>;

    async fn apply(&self, spec: &Value) -> Result<()>;

    async fn compile_package(&self, request: &CompilePackageRequest) -> Result<CompiledArtifact>;
}

/// Opens agent connections for freshly created VMs.
pub trait AgentConnector: Send + Sync {
    fn connect(&self, vm: &VmRecord) -> Arc<dyn AgentClient>;
}
