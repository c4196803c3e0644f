// ── Identity map ──
//
// Exactly one in-memory instance per persisted entity, keyed by primary
// key. Removal leaves a tombstone so stale handles looking the entity up
// again get `Deleted` rather than `NotFound`. Each table publishes a
// `watch` snapshot for consumers that want to observe membership.

use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::CoreError;
use crate::model::{Device, Domain, DomainKey, FirmwareStore, ManagedSet};

enum Slot<T> {
    Live(Arc<T>),
    Deleted,
}

/// One entity type's slice of the identity map.
pub struct Table<K, T> {
    entity_type: &'static str,
    slots: DashMap<K, Slot<T>>,
    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,
}

impl<K, T> Table<K, T>
where
    K: Eq + Hash + Clone + Display,
    T: Send + Sync + 'static,
{
    fn new(entity_type: &'static str) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            entity_type,
            slots: DashMap::new(),
            snapshot,
        }
    }

    /// Register a new entity. A tombstoned key may be reused.
    pub fn insert(&self, key: K, entity: Arc<T>) -> Result<Arc<T>, CoreError> {
        {
            let mut slot = self.slots.entry(key.clone()).or_insert(Slot::Deleted);
            if matches!(*slot, Slot::Live(_)) {
                return Err(CoreError::AlreadyExists {
                    entity_type: self.entity_type.into(),
                    identifier: key.to_string(),
                });
            }
            *slot = Slot::Live(Arc::clone(&entity));
        }
        self.rebuild_snapshot();
        Ok(entity)
    }

    pub fn get(&self, key: &K) -> Result<Arc<T>, CoreError> {
        match self.slots.get(key).as_deref() {
            Some(Slot::Live(entity)) => Ok(Arc::clone(entity)),
            Some(Slot::Deleted) => Err(CoreError::deleted(self.entity_type, key.to_string())),
            None => Err(CoreError::not_found(self.entity_type, key.to_string())),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        matches!(self.slots.get(key).as_deref(), Some(Slot::Live(_)))
    }

    /// Tombstone an entity. Returns the removed instance.
    pub fn remove(&self, key: &K) -> Result<Arc<T>, CoreError> {
        let removed = {
            let Some(mut slot) = self.slots.get_mut(key) else {
                return Err(CoreError::not_found(self.entity_type, key.to_string()));
            };
            match std::mem::replace(&mut *slot, Slot::Deleted) {
                Slot::Live(entity) => entity,
                Slot::Deleted => {
                    return Err(CoreError::deleted(self.entity_type, key.to_string()));
                }
            }
        };
        self.rebuild_snapshot();
        Ok(removed)
    }

    pub fn values(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    pub fn len(&self) -> usize {
        self.snapshot.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rebuild_snapshot(&self) {
        let values: Vec<Arc<T>> = self
            .slots
            .iter()
            .filter_map(|r| match r.value() {
                Slot::Live(entity) => Some(Arc::clone(entity)),
                Slot::Deleted => None,
            })
            .collect();
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }
}

/// Every live entity the manager knows about.
pub struct Registry {
    pub devices: Table<String, Device>,
    pub managed_sets: Table<String, ManagedSet>,
    pub domains: Table<DomainKey, Domain>,
    pub firmware: FirmwareStore,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            devices: Table::new("Device"),
            managed_sets: Table::new("ManagedSet"),
            domains: Table::new("Domain"),
            firmware: FirmwareStore::new(),
        }
    }

    pub fn device(&self, serial: &str) -> Result<Arc<Device>, CoreError> {
        self.devices.get(&serial.to_owned())
    }

    pub fn managed_set(&self, name: &str) -> Result<Arc<ManagedSet>, CoreError> {
        self.managed_sets.get(&name.to_owned())
    }

    pub fn domain(&self, key: &DomainKey) -> Result<Arc<Domain>, CoreError> {
        self.domains.get(key)
    }

    /// Managed domains of one device, ordered by name.
    pub fn domains_of(&self, serial: &str) -> Vec<Arc<Domain>> {
        let mut domains: Vec<_> = self
            .domains
            .values()
            .iter()
            .filter(|d| d.device().serial() == serial)
            .cloned()
            .collect();
        domains.sort_by(|a, b| a.name().cmp(b.name()));
        domains
    }

    /// Managed domains with this name on any device.
    pub fn domains_named(&self, name: &str) -> Vec<Arc<Domain>> {
        self.domains
            .values()
            .iter()
            .filter(|d| d.name() == name)
            .cloned()
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
