// src/store/memory.rs

//! In-memory stores.
//!
//! Suitable for tests and single-process use; nothing survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{CompiledPackageStore, VmRecord, VmStore};
use crate::errors::{CompileError, Result};
use crate::types::{CompiledPackage, PackageId, StemcellId};

type CompiledKey = (PackageId, String, StemcellId);

#[derive(Debug, Default)]
pub struct InMemoryCompiledPackageStore {
    rows: Mutex<BTreeMap<CompiledKey, CompiledPackage>>,
}

impl InMemoryCompiledPackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, ordered by key.
    pub fn all(&self) -> Vec<CompiledPackage> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Rows for one package across stemcells and dependency keys.
    pub fn for_package(&self, package_id: PackageId) -> Vec<CompiledPackage> {
        self.all()
            .into_iter()
            .filter(|cp| cp.package_id == package_id)
            .collect()
    }
}

#[async_trait]
impl CompiledPackageStore for InMemoryCompiledPackageStore {
    async fn find(
        &self,
        package_id: PackageId,
        dependency_key: &str,
        stemcell_id: StemcellId,
    ) -> Result<Option<CompiledPackage>> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .get(&(package_id, dependency_key.to_string(), stemcell_id))
            .cloned())
    }

    async fn next_build(&self, package_id: PackageId, stemcell_id: StemcellId) -> Result<u32> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let highest = rows
            .values()
            .filter(|cp| cp.package_id == package_id && cp.stemcell_id == stemcell_id)
            .map(|cp| cp.build)
            .max()
            .unwrap_or(0);
        Ok(highest + 1)
    }

    async fn create(&self, compiled_package: CompiledPackage) -> Result<CompiledPackage> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (
            compiled_package.package_id,
            compiled_package.dependency_key.clone(),
            compiled_package.stemcell_id,
        );
        if rows.contains_key(&key) {
            return Err(CompileError::DuplicateCompiledPackage {
                package_id: compiled_package.package_id.0,
                stemcell_id: compiled_package.stemcell_id.0,
                dependency_key: compiled_package.dependency_key,
            });
        }
        rows.insert(key, compiled_package.clone());
        Ok(compiled_package)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryVmStore {
    vms: Mutex<HashMap<String, VmRecord>>,
}

impl InMemoryVmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cid: &str) -> Option<VmRecord> {
        self.vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.vms.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VmStore for InMemoryVmStore {
    async fn create(&self, record: VmRecord) -> Result<VmRecord> {
        let mut vms = self.vms.lock().unwrap_or_else(PoisonError::into_inner);
        if vms.contains_key(&record.cid) {
            return Err(CompileError::Store(format!(
                "VM `{}' already recorded",
                record.cid
            )));
        }
        vms.insert(record.cid.clone(), record.clone());
        Ok(record)
    }

    async fn delete(&self, cid: &str) -> Result<()> {
        self.vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cid);
        Ok(())
    }
}
