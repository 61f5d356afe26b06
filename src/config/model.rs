// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::types::VmReusePolicy;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [director]
/// name = "my-director"
/// max_vm_create_tries = 5
///
/// [compilation]
/// network = "default"
/// workers = 3
/// reuse_compilation_vms = true
///
/// [network.default]
/// dns = ["10.0.0.2"]
/// ```
///
/// This is the unvalidated form; convert it with `ConfigFile::try_from`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub director: DirectorSection,

    pub compilation: CompilationConfig,

    /// Networks by name. The compilation network must be one of these.
    #[serde(default)]
    pub network: BTreeMap<String, NetworkConfig>,
}

/// Validated configuration.
///
/// Only constructible through `TryFrom<RawConfigFile>`, which enforces the
/// invariants in `config::validate`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub director: DirectorSection,
    pub compilation: CompilationConfig,
    pub network: BTreeMap<String, NetworkConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        director: DirectorSection,
        compilation: CompilationConfig,
        network: BTreeMap<String, NetworkConfig>,
    ) -> Self {
        Self {
            director,
            compilation,
            network,
        }
    }

    /// The network compilation VMs are placed on.
    pub fn compilation_network(&self) -> Option<&NetworkConfig> {
        self.network.get(&self.compilation.network_name)
    }
}

/// `[director]` section: director-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorSection {
    /// Director name, attached to VM metadata.
    #[serde(default = "default_director_name")]
    pub name: String,

    /// Attempts at `create_vm` when the cloud reports retryable failures.
    #[serde(default = "default_max_vm_create_tries")]
    pub max_vm_create_tries: u32,

    /// Generate per-VM agent credentials.
    #[serde(default)]
    pub encryption: bool,

    /// Consult the global compiled package cache.
    #[serde(default)]
    pub use_compiled_package_cache: bool,

    /// PEM bundle pushed to every agent.
    #[serde(default)]
    pub trusted_certs: String,

    #[serde(default = "default_agent_wait_timeout_secs")]
    pub agent_wait_timeout_secs: u64,

    /// Upper bound for a single `compile_package` RPC.
    #[serde(default = "default_compile_timeout_secs")]
    pub compile_timeout_secs: u64,

    /// How long to wait for another director's compile lock.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Lease length of a compile lock; renewed while held.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

fn default_director_name() -> String {
    "pkgcompile".to_string()
}

fn default_max_vm_create_tries() -> u32 {
    5
}

fn default_agent_wait_timeout_secs() -> u64 {
    600
}

fn default_compile_timeout_secs() -> u64 {
    3600
}

fn default_lock_timeout_secs() -> u64 {
    900
}

fn default_lock_lease_secs() -> u64 {
    60
}

impl Default for DirectorSection {
    fn default() -> Self {
        Self {
            name: default_director_name(),
            max_vm_create_tries: default_max_vm_create_tries(),
            encryption: false,
            use_compiled_package_cache: false,
            trusted_certs: String::new(),
            agent_wait_timeout_secs: default_agent_wait_timeout_secs(),
            compile_timeout_secs: default_compile_timeout_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            lock_lease_secs: default_lock_lease_secs(),
        }
    }
}

impl DirectorSection {
    pub fn agent_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_wait_timeout_secs)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }
}

/// `[compilation]` section: settings for one compilation run.
#[derive(Debug, Clone, Deserialize)]
pub struct CompilationConfig {
    #[serde(rename = "network")]
    pub network_name: String,

    /// Maximum number of packages compiled at the same time.
    pub workers: usize,

    #[serde(default)]
    pub reuse_compilation_vms: bool,

    #[serde(default)]
    pub availability_zone: Option<String>,

    #[serde(default = "empty_object")]
    pub cloud_properties: Value,

    /// Agent environment passed to `create_vm`.
    #[serde(default = "empty_object")]
    pub env: Value,
}

impl CompilationConfig {
    pub fn new(network_name: impl Into<String>, workers: usize) -> Self {
        Self {
            network_name: network_name.into(),
            workers,
            reuse_compilation_vms: false,
            availability_zone: None,
            cloud_properties: empty_object(),
            env: empty_object(),
        }
    }

    pub fn reuse_policy(&self) -> VmReusePolicy {
        VmReusePolicy::from(self.reuse_compilation_vms)
    }
}

/// `[network.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NetworkConfig {
    #[serde(default = "empty_object")]
    pub cloud_properties: Value,

    #[serde(default)]
    pub dns: Vec<String>,
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}
