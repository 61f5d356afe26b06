// src/errors.rs

//! Crate-wide error type and `Result` alias.

use std::time::Duration;

use thiserror::Error;

use crate::cloud::CloudError;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Package `{package}' depends on `{dependency}', which is not part of the release")]
    UnresolvableDependency { package: String, dependency: String },

    #[error("Cycle detected in package dependencies: {0}")]
    DependencyCycle(String),

    #[error("VM creation failed (retryable: {retryable}): {message}")]
    VmCreationFailed { retryable: bool, message: String },

    #[error("Cloud error: {0}")]
    Cloud(String),

    #[error("Timed out waiting for agent `{agent_id}' to respond to `{method}'")]
    RpcTimeout { method: String, agent_id: String },

    #[error("Agent `{method}' failed: {message}")]
    Agent { method: String, message: String },

    #[error("Failed to acquire lock for {resource} after {waited:?}")]
    LockTimeout { resource: String, waited: Duration },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error(
        "Compiled package for package {package_id} / stemcell {stemcell_id} with dependency key {dependency_key} already exists"
    )]
    DuplicateCompiledPackage {
        package_id: u64,
        stemcell_id: u64,
        dependency_key: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Instance `{0}' has no VM bound")]
    InstanceNotProvisioned(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CompileError {
    /// Whether the cloud reported this failure as safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompileError::VmCreationFailed { retryable: true, .. })
    }
}

impl From<CloudError> for CompileError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::VmCreationFailed { retryable, message } => {
                CompileError::VmCreationFailed { retryable, message }
            }
            CloudError::Other(message) => CompileError::Cloud(message),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, CompileError>;
