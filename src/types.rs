// src/types.rs

//! Identities and records shared across the crate.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Database id of a package row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageId(pub u64);

/// Database id of a stemcell row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StemcellId(pub u64);

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StemcellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A source package as defined by a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    pub version: String,
    /// Content fingerprint of the package source.
    pub fingerprint: String,
    /// SHA1 of the source tarball.
    pub sha1: String,
    /// Blobstore id of the source tarball.
    pub blobstore_id: String,
    /// Names of the direct dependencies.
    pub dependency_set: BTreeSet<String>,
}

impl Package {
    pub fn desc(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

/// A base machine image that packages are compiled against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stemcell {
    pub id: StemcellId,
    pub name: String,
    pub version: String,
    /// Provider-specific image id passed to `create_vm`.
    pub cid: String,
}

impl Stemcell {
    pub fn desc(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

/// Durable record of a compiled package.
///
/// Unique per `(package_id, dependency_key, stemcell_id)`; never mutated
/// once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPackage {
    pub package_id: PackageId,
    pub package_name: String,
    pub package_version: String,
    pub stemcell_id: StemcellId,
    pub dependency_key: String,
    pub build: u32,
    pub sha1: String,
    pub blobstore_id: String,
}

impl CompiledPackage {
    /// Version string as sent to agents: `<package version>.<build>`.
    pub fn versioned_build(&self) -> String {
        format!("{}.{}", self.package_version, self.build)
    }

    /// Descriptor handed to agents compiling a dependent package.
    pub fn descriptor(&self) -> PackageDescriptor {
        PackageDescriptor {
            name: self.package_name.clone(),
            version: self.versioned_build(),
            sha1: self.sha1.clone(),
            blobstore_id: self.blobstore_id.clone(),
        }
    }
}

/// Location of a compiled artifact in a blobstore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub sha1: String,
    pub blobstore_id: String,
}

/// Compiled dependency as described in a compile RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub sha1: String,
    pub blobstore_id: String,
}

/// Whether compilation VMs are kept alive between tasks of a stemcell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmReusePolicy {
    /// Keep idle VMs around and hand them to the next task of the same stemcell.
    Reuse,
    /// Provision a fresh VM for every task and delete it afterwards.
    SingleUse,
}

impl From<bool> for VmReusePolicy {
    fn from(reuse_compilation_vms: bool) -> Self {
        if reuse_compilation_vms {
            VmReusePolicy::Reuse
        } else {
            VmReusePolicy::SingleUse
        }
    }
}
