#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

use pkgcompile::config::{
    CompilationConfig, ConfigFile, DirectorSection, NetworkConfig, RawConfigFile,
};
use pkgcompile::jobs::{Job, PlannedJob, ReleaseTemplate, Template};
use pkgcompile::release::ReleaseVersion;
use pkgcompile::types::{Package, PackageId, Stemcell, StemcellId};

static NEXT_ID: AtomicU64 = AtomicU64::new(1000);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Builder for `Package`.
pub struct PackageBuilder {
    package: Package,
}

impl PackageBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            package: Package {
                id: PackageId(next_id()),
                name: name.to_string(),
                version: "1.0".to_string(),
                fingerprint: format!("fp-{name}"),
                sha1: format!("sha1-{name}"),
                blobstore_id: format!("blob-{name}"),
                dependency_set: BTreeSet::new(),
            },
        }
    }

    pub fn id(mut self, id: u64) -> Self {
        self.package.id = PackageId(id);
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.package.version = version.to_string();
        self
    }

    pub fn fingerprint(mut self, fingerprint: &str) -> Self {
        self.package.fingerprint = fingerprint.to_string();
        self
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.package.dependency_set.insert(dep.to_string());
        self
    }

    pub fn build(self) -> Package {
        self.package
    }
}

/// Builder for `ReleaseVersion`.
pub struct ReleaseBuilder {
    release: ReleaseVersion,
}

impl ReleaseBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            release: ReleaseVersion::new(name, "1"),
        }
    }

    pub fn package(mut self, package: PackageBuilder) -> Self {
        self.release.add_package(package.build());
        self
    }

    pub fn build(self) -> Arc<ReleaseVersion> {
        Arc::new(self.release)
    }
}

/// Builder for `Stemcell`.
pub struct StemcellBuilder {
    stemcell: Stemcell,
}

impl StemcellBuilder {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            stemcell: Stemcell {
                id: StemcellId(next_id()),
                name: name.to_string(),
                version: version.to_string(),
                cid: format!("stemcell-cid-{name}-{version}"),
            },
        }
    }

    pub fn id(mut self, id: u64) -> Self {
        self.stemcell.id = StemcellId(id);
        self
    }

    pub fn build(self) -> Stemcell {
        self.stemcell
    }
}

/// Builder for `PlannedJob`. Templates name packages of the job's release.
pub struct JobBuilder {
    name: String,
    release: Arc<ReleaseVersion>,
    stemcell: Stemcell,
    templates: Vec<Arc<dyn Template>>,
}

impl JobBuilder {
    pub fn new(name: &str, release: &Arc<ReleaseVersion>, stemcell: &Stemcell) -> Self {
        Self {
            name: name.to_string(),
            release: Arc::clone(release),
            stemcell: stemcell.clone(),
            templates: Vec::new(),
        }
    }

    pub fn template(mut self, name: &str, packages: &[&str]) -> Self {
        let packages = packages
            .iter()
            .map(|p| {
                Arc::clone(
                    self.release
                        .package(p)
                        .unwrap_or_else(|| panic!("package {p} not in release")),
                )
            })
            .collect();
        self.templates.push(Arc::new(ReleaseTemplate::new(
            name,
            Arc::clone(&self.release),
            packages,
        )));
        self
    }

    pub fn build(self) -> Arc<PlannedJob> {
        Arc::new(PlannedJob::new(
            self.name,
            self.release,
            self.stemcell,
            self.templates,
        ))
    }
}

/// Erase a concrete job for `PackageCompiler`.
pub fn as_jobs(jobs: &[Arc<PlannedJob>]) -> Vec<Arc<dyn Job>> {
    jobs.iter()
        .map(|j| Arc::clone(j) as Arc<dyn Job>)
        .collect()
}

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut network = BTreeMap::new();
        network.insert(
            "default".to_string(),
            NetworkConfig {
                cloud_properties: json!({ "subnet": "subnet-1" }),
                dns: vec!["10.0.0.2".to_string()],
            },
        );
        Self {
            config: RawConfigFile {
                director: DirectorSection {
                    name: "test-director".to_string(),
                    ..DirectorSection::default()
                },
                compilation: CompilationConfig::new("default", 2),
                network,
            },
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.compilation.workers = workers;
        self
    }

    pub fn reuse_compilation_vms(mut self, reuse: bool) -> Self {
        self.config.compilation.reuse_compilation_vms = reuse;
        self
    }

    pub fn max_vm_create_tries(mut self, tries: u32) -> Self {
        self.config.director.max_vm_create_tries = tries;
        self
    }

    pub fn encryption(mut self, on: bool) -> Self {
        self.config.director.encryption = on;
        self
    }

    pub fn use_compiled_package_cache(mut self, on: bool) -> Self {
        self.config.director.use_compiled_package_cache = on;
        self
    }

    pub fn trusted_certs(mut self, certs: &str) -> Self {
        self.config.director.trusted_certs = certs.to_string();
        self
    }

    pub fn lock_timeout_secs(mut self, secs: u64) -> Self {
        self.config.director.lock_timeout_secs = secs;
        self
    }

    pub fn compile_timeout_secs(mut self, secs: u64) -> Self {
        self.config.director.compile_timeout_secs = secs;
        self
    }

    pub fn env(mut self, env: Value) -> Self {
        self.config.compilation.env = env;
        self
    }

    pub fn cloud_properties(mut self, props: Value) -> Self {
        self.config.compilation.cloud_properties = props;
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
