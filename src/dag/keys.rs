// src/dag/keys.rs

//! Lookup keys for compiled packages.

use std::sync::Arc;

use blake3::Hasher;

use crate::types::{Package, Stemcell};

/// Stable key over a package's transitive dependencies.
///
/// Dependencies are hashed as sorted `(name, version)` pairs, so the key
/// does not depend on the order the closure was discovered in.
pub fn dependency_key(transitive_dependencies: &[Arc<Package>]) -> String {
    let mut pairs: Vec<(&str, &str)> = transitive_dependencies
        .iter()
        .map(|p| (p.name.as_str(), p.version.as_str()))
        .collect();
    pairs.sort();
    pairs.dedup();

    let mut hasher = Hasher::new();
    for (name, version) in pairs {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(version.as_bytes());
        hasher.update(&[b'\n']);
    }
    hasher.finalize().to_hex().to_string()
}

/// Key for the global compiled-package cache.
///
/// Covers the package fingerprint, its dependency key and the stemcell, so
/// that the same key never names artifacts built from different inputs.
pub fn cache_key(package: &Package, dependency_key: &str, stemcell: &Stemcell) -> String {
    let mut hasher = Hasher::new();
    hasher.update(package.fingerprint.as_bytes());
    hasher.update(&[0]);
    hasher.update(dependency_key.as_bytes());
    hasher.update(&[0]);
    hasher.update(stemcell.name.as_bytes());
    hasher.update(b"/");
    hasher.update(stemcell.version.as_bytes());
    hasher.finalize().to_hex().to_string()
}
