// ── ManagedSet ──

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::lock::{EntityLock, LockGuard};

/// Named group of devices sharing one management scope and one work area.
pub struct ManagedSet {
    name: String,
    lock: EntityLock,
    members: ArcSwap<BTreeSet<String>>,
}

impl ManagedSet {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            lock: EntityLock::new(format!("managed set {name}")),
            name,
            members: ArcSwap::from_pointee(BTreeSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> &EntityLock {
        &self.lock
    }

    /// Serials of member devices.
    pub fn members(&self) -> Arc<BTreeSet<String>> {
        self.members.load_full()
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.members.load().contains(serial)
    }

    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }

    pub(crate) fn insert_member(&self, guard: &LockGuard, serial: &str) {
        debug_assert!(guard.guards(&self.lock));
        let mut next = BTreeSet::clone(&self.members.load());
        next.insert(serial.to_owned());
        self.members.store(Arc::new(next));
    }

    pub(crate) fn remove_member(&self, guard: &LockGuard, serial: &str) {
        debug_assert!(guard.guards(&self.lock));
        let mut next = BTreeSet::clone(&self.members.load());
        next.remove(serial);
        self.members.store(Arc::new(next));
    }

    /// Restore membership while rebuilding from persisted records.
    pub(crate) fn restore_members(&self, members: BTreeSet<String>) {
        self.members.store(Arc::new(members));
    }
}

impl std::fmt::Debug for ManagedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSet")
            .field("name", &self.name)
            .field("members", &self.members.load())
            .finish_non_exhaustive()
    }
}
