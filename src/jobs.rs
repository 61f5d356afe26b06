// src/jobs.rs

//! Jobs and templates as seen by the package compiler.
//!
//! The compiler only needs a narrow view of the deployment plan: which
//! release and stemcell a job uses, which packages its templates require,
//! and a way to hand compiled packages back to the job once they exist.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};

use crate::release::ReleaseVersion;
use crate::types::{CompiledPackage, Package, Stemcell};

/// A job template that requires packages from a release.
pub trait Template: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn release(&self) -> &Arc<ReleaseVersion>;
    fn package_models(&self) -> &[Arc<Package>];

    /// `release/template`, as used in diagnostics.
    fn desc(&self) -> String {
        format!("{}/{}", self.release().name, self.name())
    }
}

/// A job whose templates need compiled packages for its stemcell.
pub trait Job: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn release(&self) -> &Arc<ReleaseVersion>;
    fn stemcell(&self) -> &Stemcell;
    fn templates(&self) -> &[Arc<dyn Template>];

    /// Called once per required package once its compiled artifact exists.
    fn use_compiled_package(&self, compiled_package: &CompiledPackage);
}

/// Template backed directly by a release's package list.
#[derive(Debug, Clone)]
pub struct ReleaseTemplate {
    name: String,
    release: Arc<ReleaseVersion>,
    packages: Vec<Arc<Package>>,
}

impl ReleaseTemplate {
    pub fn new(name: impl Into<String>, release: Arc<ReleaseVersion>, packages: Vec<Arc<Package>>) -> Self {
        Self {
            name: name.into(),
            release,
            packages,
        }
    }
}

impl Template for ReleaseTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&self) -> &Arc<ReleaseVersion> {
        &self.release
    }

    fn package_models(&self) -> &[Arc<Package>] {
        &self.packages
    }
}

/// A job from the deployment plan.
///
/// Compiled packages handed to it are kept (keyed by package name) so the
/// plan can later render the job's package spec.
#[derive(Debug)]
pub struct PlannedJob {
    name: String,
    release: Arc<ReleaseVersion>,
    stemcell: Stemcell,
    templates: Vec<Arc<dyn Template>>,
    compiled: Mutex<BTreeMap<String, CompiledPackage>>,
}

impl PlannedJob {
    pub fn new(
        name: impl Into<String>,
        release: Arc<ReleaseVersion>,
        stemcell: Stemcell,
        templates: Vec<Arc<dyn Template>>,
    ) -> Self {
        Self {
            name: name.into(),
            release,
            stemcell,
            templates,
            compiled: Mutex::new(BTreeMap::new()),
        }
    }

    /// Compiled packages received so far, keyed by package name.
    pub fn compiled_packages(&self) -> BTreeMap<String, CompiledPackage> {
        self.compiled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Job for PlannedJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&self) -> &Arc<ReleaseVersion> {
        &self.release
    }

    fn stemcell(&self) -> &Stemcell {
        &self.stemcell
    }

    fn templates(&self) -> &[Arc<dyn Template>] {
        &self.templates
    }

    fn use_compiled_package(&self, compiled_package: &CompiledPackage) {
        self.compiled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(compiled_package.package_name.clone(), compiled_package.clone());
    }
}
