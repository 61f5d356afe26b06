// src/exec/mod.rs

//! Compilation instances and the machinery behind them.
//!
//! - [`pool`] hands instances to compile workers, reused or single-use.
//! - [`reuser`] tracks idle and in-use instances per stemcell.
//! - [`provisioner`] creates VMs with retry and bootstraps their agents.
//! - [`deleter`] tears instances down.
//! - [`instance`] and [`network`] model the instances themselves.

pub mod deleter;
pub mod instance;
pub mod network;
pub mod pool;
pub mod provisioner;
pub mod reuser;

pub use deleter::InstanceDeleter;
pub use instance::{Instance, InstanceSpec};
pub use network::{DynamicIpProvider, IpProvider, NetworkReservation};
pub use pool::CompilationInstancePool;
pub use provisioner::{ProvisionerSettings, VmCreator};
pub use reuser::InstanceReuser;
