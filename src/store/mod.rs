// src/store/mod.rs

//! Persistence for compiled packages and VM records.
//!
//! Only the record shapes the compiler needs are modelled here. Production
//! directors back these traits with their database; [`memory`] provides
//! process-local implementations.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::types::{CompiledPackage, PackageId, StemcellId};

pub use memory::{InMemoryCompiledPackageStore, InMemoryVmStore};

/// Compiled package rows.
///
/// Rows are append-only; `create` must reject a second row for the same
/// `(package_id, dependency_key, stemcell_id)` with
/// `CompileError::DuplicateCompiledPackage`.
#[async_trait]
pub trait CompiledPackageStore: Send + Sync {
    async fn find(
        &self,
        package_id: PackageId,
        dependency_key: &str,
        stemcell_id: StemcellId,
    ) -> Result<Option<CompiledPackage>>;

    /// Next build number for a package on a stemcell (highest existing + 1).
    async fn next_build(&self, package_id: PackageId, stemcell_id: StemcellId) -> Result<u32>;

    async fn create(&self, compiled_package: CompiledPackage) -> Result<CompiledPackage>;
}

/// Per-VM agent credentials, present when encryption is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCredentials {
    pub crypt_key: String,
    pub sign_key: String,
}

/// A persisted VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub cid: String,
    pub agent_id: String,
    /// Id of the instance the VM was created for.
    pub instance_id: String,
    pub credentials: Option<VmCredentials>,
}

#[async_trait]
pub trait VmStore: Send + Sync {
    async fn create(&self, record: VmRecord) -> Result<VmRecord>;

    async fn delete(&self, cid: &str) -> Result<()>;
}
