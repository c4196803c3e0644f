// ── In-memory repository ──

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{Record, RecordKey, Repository, SaveMode};
use crate::error::CoreError;

/// `Repository` backed by a `DashMap`. Used by tests and by hosts that
/// do not need durability.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    records: DashMap<RecordKey, Record>,
    save_lock: Mutex<()>,
    saves: AtomicU64,
    skipped_saves: AtomicU64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.records.get(key).map(|r| r.value().clone())
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Completed saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Unforced saves skipped because another save was running.
    pub fn skipped_save_count(&self) -> u64 {
        self.skipped_saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create(&self, record: Record) -> Result<(), CoreError> {
        let key = record.key();
        match self.records.entry(key) {
            Entry::Occupied(entry) => Err(CoreError::AlreadyExists {
                entity_type: "Record".into(),
                identifier: format!("{:?}", entry.key()),
            }),
            Entry::Vacant(entry) => {
                trace!(key = ?entry.key(), "record created");
                entry.insert(record);
                Ok(())
            }
        }
    }

    async fn update(&self, record: Record) -> Result<(), CoreError> {
        let key = record.key();
        trace!(key = ?key, "record updated");
        self.records.insert(key, record);
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), CoreError> {
        if self.records.remove(key).is_some() {
            trace!(key = ?key, "record deleted");
        }
        Ok(())
    }

    async fn save(&self, mode: SaveMode) -> Result<bool, CoreError> {
        let _guard = match mode {
            SaveMode::Forced => self.save_lock.lock().await,
            SaveMode::Unforced => {
                if let Ok(guard) = self.save_lock.try_lock() {
                    guard
                } else {
                    self.skipped_saves.fetch_add(1, Ordering::Relaxed);
                    debug!("unforced save skipped, another save in progress");
                    return Ok(false);
                }
            }
        };
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn load_all(&self) -> Result<Vec<Record>, CoreError> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }
}
