// src/engine/cache.rs

//! Optional cross-director cache of compiled artifacts, keyed by cache key.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{CompiledArtifact, CompiledPackage, Package};

/// Blobstore-backed cache shared by directors.
///
/// Errors are never fatal to a compile run: lookup failures count as a
/// miss and save failures are logged and dropped.
#[async_trait]
pub trait GlobalCache: Send + Sync {
    async fn exists_in_global_cache(&self, package: &Package, cache_key: &str) -> Result<bool>;

    async fn fetch_from_global_cache(
        &self,
        package: &Package,
        cache_key: &str,
    ) -> Result<Option<CompiledArtifact>>;

    async fn save_to_global_cache(&self, compiled_package: &CompiledPackage, cache_key: &str) -> Result<()>;
}
