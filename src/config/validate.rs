// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{CompileError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = CompileError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.director, raw.compilation, raw.network))
    }
}

pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    validate_raw_config(cfg)
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_director(cfg)?;
    validate_compilation(cfg)?;
    validate_compilation_network(cfg)?;
    Ok(())
}

fn validate_director(cfg: &RawConfigFile) -> Result<()> {
    let director = &cfg.director;

    if director.name.trim().is_empty() {
        return Err(CompileError::Config(
            "[director].name must not be empty".to_string(),
        ));
    }

    if director.max_vm_create_tries == 0 {
        return Err(CompileError::Config(
            "[director].max_vm_create_tries must be >= 1 (got 0)".to_string(),
        ));
    }

    for (field, value) in [
        ("agent_wait_timeout_secs", director.agent_wait_timeout_secs),
        ("compile_timeout_secs", director.compile_timeout_secs),
        ("lock_timeout_secs", director.lock_timeout_secs),
        ("lock_lease_secs", director.lock_lease_secs),
    ] {
        if value == 0 {
            return Err(CompileError::Config(format!(
                "[director].{field} must be >= 1 (got 0)"
            )));
        }
    }

    Ok(())
}

fn validate_compilation(cfg: &RawConfigFile) -> Result<()> {
    if cfg.compilation.workers == 0 {
        return Err(CompileError::Config(
            "[compilation].workers must be >= 1 (got 0)".to_string(),
        ));
    }

    if !cfg.compilation.cloud_properties.is_object() {
        return Err(CompileError::Config(
            "[compilation].cloud_properties must be a table".to_string(),
        ));
    }

    if !cfg.compilation.env.is_object() {
        return Err(CompileError::Config(
            "[compilation].env must be a table".to_string(),
        ));
    }

    Ok(())
}

fn validate_compilation_network(cfg: &RawConfigFile) -> Result<()> {
    let name = &cfg.compilation.network_name;
    if !cfg.network.contains_key(name) {
        return Err(CompileError::Config(format!(
            "[compilation] refers to unknown network '{}'",
            name
        )));
    }
    Ok(())
}
