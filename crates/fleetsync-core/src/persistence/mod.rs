// ── Persistence contract ──
//
// The core never talks to storage directly. It stages record writes while
// holding the relevant entity lock, then asks for a `save`. Unforced saves
// are best effort and may be skipped when another save is running.

mod memory;
pub mod record;

use async_trait::async_trait;

pub use memory::InMemoryRepository;
pub use record::{
    DeviceRecord, DomainRecord, DomainVersionRecord, FirmwareRecord, FirmwareVersionRecord,
    ManagedSetRecord, PolicyVersionRecord, Record, RecordKey, TagRecord,
};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Must reach storage or fail.
    Forced,
    /// May be skipped under contention.
    Unforced,
}

/// Durable storage for managed entities.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` on a duplicate key.
    async fn create(&self, record: Record) -> Result<(), CoreError>;

    /// Replace a record, inserting it if absent.
    async fn update(&self, record: Record) -> Result<(), CoreError>;

    /// Delete a record. Deleting an absent key is not an error.
    async fn delete(&self, key: &RecordKey) -> Result<(), CoreError>;

    /// Flush staged writes. Returns `false` if an unforced save was skipped.
    async fn save(&self, mode: SaveMode) -> Result<bool, CoreError>;

    /// Every stored record, parents before children.
    async fn load_all(&self) -> Result<Vec<Record>, CoreError>;
}
