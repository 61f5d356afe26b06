// src/exec/reuser.rs

//! Registry of reusable compilation instances, keyed by stemcell.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::exec::instance::Instance;
use crate::types::{Stemcell, StemcellId};

#[derive(Debug)]
struct Slot {
    instance: Arc<Instance>,
    in_use: bool,
}

/// Idle/in-use bookkeeping for compilation instances.
///
/// Every operation takes the same lock, so concurrent workers never hand the
/// same idle instance out twice.
#[derive(Debug, Default)]
pub struct InstanceReuser {
    slots: Mutex<HashMap<StemcellId, Vec<Slot>>>,
}

impl InstanceReuser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an idle instance for `stemcell`, if any.
    pub fn get_instance(&self, stemcell: &Stemcell) -> Option<Arc<Instance>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .get_mut(&stemcell.id)?
            .iter_mut()
            .find(|slot| !slot.in_use)?;
        slot.in_use = true;
        debug!(instance = %slot.instance.id(), stemcell = %stemcell.desc(), "reusing idle instance");
        Some(Arc::clone(&slot.instance))
    }

    /// Register a newly created instance as in use.
    pub fn add_in_use_instance(&self, instance: Arc<Instance>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(instance.stemcell().id)
            .or_default()
            .push(Slot {
                instance,
                in_use: true,
            });
    }

    /// Mark an instance idle again.
    pub fn release_instance(&self, instance: &Instance) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots
            .get_mut(&instance.stemcell().id)
            .and_then(|list| list.iter_mut().find(|slot| slot.instance.id() == instance.id()))
        {
            slot.in_use = false;
        }
    }

    /// Forget an instance. Returns whether it was registered.
    pub fn remove_instance(&self, instance: &Instance) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = slots.get_mut(&instance.stemcell().id) else {
            return false;
        };
        let before = list.len();
        list.retain(|slot| slot.instance.id() != instance.id());
        let removed = list.len() != before;
        if list.is_empty() {
            slots.remove(&instance.stemcell().id);
        }
        removed
    }

    /// Snapshot of every registered instance.
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .flatten()
            .map(|slot| Arc::clone(&slot.instance))
            .collect()
    }

    pub fn num_instances(&self, stemcell: &Stemcell) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&stemcell.id).map_or(0, Vec::len)
    }

    pub fn num_in_use(&self, stemcell: &Stemcell) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(&stemcell.id)
            .map_or(0, |list| list.iter().filter(|slot| slot.in_use).count())
    }
}
