// src/exec/network.rs

//! Network reservations for compilation instances.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cloud::NetworkSettings;
use crate::config::NetworkConfig;
use crate::errors::Result;

/// A reservation held by one instance on one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkReservation {
    pub network: String,
    pub instance_id: String,
}

/// Hands out address reservations on the compilation network.
pub trait IpProvider: Send + Sync {
    fn reserve(&self, instance_id: &str) -> Result<NetworkReservation>;

    fn release(&self, reservation: &NetworkReservation);

    /// Settings passed to `create_vm` and the instance apply spec.
    fn network_settings(&self, reservation: &NetworkReservation) -> NetworkSettings;
}

/// Dynamic (cloud-assigned) addressing on a single named network.
#[derive(Debug)]
pub struct DynamicIpProvider {
    name: String,
    network: NetworkConfig,
    reserved: Mutex<BTreeSet<String>>,
}

impl DynamicIpProvider {
    pub fn new(name: impl Into<String>, network: NetworkConfig) -> Self {
        Self {
            name: name.into(),
            network,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    /// Number of reservations currently held.
    pub fn reserved_count(&self) -> usize {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl IpProvider for DynamicIpProvider {
    fn reserve(&self, instance_id: &str) -> Result<NetworkReservation> {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_string());
        debug!(network = %self.name, instance = %instance_id, "reserved dynamic address");
        Ok(NetworkReservation {
            network: self.name.clone(),
            instance_id: instance_id.to_string(),
        })
    }

    fn release(&self, reservation: &NetworkReservation) {
        let removed = self
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reservation.instance_id);
        if !removed {
            warn!(
                network = %reservation.network,
                instance = %reservation.instance_id,
                "releasing a reservation that was not held"
            );
        }
    }

    fn network_settings(&self, reservation: &NetworkReservation) -> NetworkSettings {
        let settings: Value = json!({
            "type": "dynamic",
            "cloud_properties": self.network.cloud_properties,
            "dns": self.network.dns,
            "default": ["dns", "gateway"],
        });
        NetworkSettings::from([(reservation.network.clone(), settings)])
    }
}
