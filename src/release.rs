// src/release.rs

//! Release versions and package dependency resolution.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::errors::{CompileError, Result};
use crate::types::Package;

/// A release version: a named set of packages with declared dependencies.
#[derive(Debug, Clone)]
pub struct ReleaseVersion {
    pub name: String,
    pub version: String,
    packages: BTreeMap<String, Arc<Package>>,
}

impl ReleaseVersion {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            packages: BTreeMap::new(),
        }
    }

    pub fn with_package(mut self, package: Package) -> Self {
        self.add_package(package);
        self
    }

    pub fn add_package(&mut self, package: Package) -> Arc<Package> {
        let package = Arc::new(package);
        self.packages.insert(package.name.clone(), Arc::clone(&package));
        package
    }

    pub fn package(&self, name: &str) -> Option<&Arc<Package>> {
        self.packages.get(name)
    }

    pub fn packages(&self) -> impl Iterator<Item = &Arc<Package>> {
        self.packages.values()
    }

    /// Resolve the direct dependencies of `package` to release packages.
    pub fn dependencies(&self, package: &Package) -> Result<Vec<Arc<Package>>> {
        package
            .dependency_set
            .iter()
            .map(|dep| {
                self.packages.get(dep).cloned().ok_or_else(|| {
                    CompileError::UnresolvableDependency {
                        package: package.name.clone(),
                        dependency: dep.clone(),
                    }
                })
            })
            .collect()
    }

    /// Every package `package` depends on, directly or indirectly.
    ///
    /// Sorted by name. Fails if a dependency is missing from the release or
    /// if the dependency chain loops back onto itself.
    pub fn transitive_dependencies(&self, package: &Package) -> Result<Vec<Arc<Package>>> {
        let mut closed: BTreeMap<String, Arc<Package>> = BTreeMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut finished: HashSet<String> = HashSet::new();
        self.visit(package, &mut path, &mut finished, &mut closed)?;
        Ok(closed.into_values().collect())
    }

    fn visit(
        &self,
        package: &Package,
        path: &mut Vec<String>,
        finished: &mut HashSet<String>,
        closed: &mut BTreeMap<String, Arc<Package>>,
    ) -> Result<()> {
        path.push(package.name.clone());

        for dep in self.dependencies(package)? {
            if path.contains(&dep.name) {
                return Err(CompileError::DependencyCycle(format!(
                    "{} -> {}",
                    path.join(" -> "),
                    dep.name
                )));
            }
            if finished.contains(&dep.name) {
                continue;
            }
            closed.insert(dep.name.clone(), Arc::clone(&dep));
            self.visit(&dep, path, finished, closed)?;
        }

        path.pop();
        finished.insert(package.name.clone());
        Ok(())
    }
}
