// ── Firmware families and versions ──
//
// All firmware lives in one process-wide namespace guarded by a single
// lock. A family is identified by the hardware it fits (`FirmwareKey`);
// each family holds a handful of installable levels.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::DeviceState;
use crate::error::CoreError;
use crate::lock::{EntityLock, LockGuard};

// ── FirmwareLevel ────────────────────────────────────────────────────

/// Dotted firmware level (`"3.8.1.4"`), ordered component-wise as numbers.
///
/// Missing trailing components compare as zero, so `3.8` == `3.8.0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareLevel {
    raw: String,
    parts: Vec<u32>,
}

impl FirmwareLevel {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn significant(&self) -> &[u32] {
        let len = self
            .parts
            .iter()
            .rposition(|p| *p != 0)
            .map_or(0, |i| i + 1);
        self.parts.get(..len).unwrap_or_default()
    }
}

impl FromStr for FirmwareLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .trim()
            .split('.')
            .map(str::parse::<u32>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CoreError::validation(format!("invalid firmware level: {s:?}")))?;
        Ok(Self {
            raw: s.trim().to_owned(),
            parts,
        })
    }
}

impl TryFrom<String> for FirmwareLevel {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FirmwareLevel> for String {
    fn from(level: FirmwareLevel) -> Self {
        level.raw
    }
}

impl fmt::Display for FirmwareLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for FirmwareLevel {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for FirmwareLevel {}

impl PartialOrd for FirmwareLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.significant().cmp(other.significant())
    }
}

// ── FirmwareKey ──────────────────────────────────────────────────────

/// Hardware a firmware family applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareKey {
    pub device_type: String,
    pub model_type: String,
    pub strict_features: BTreeSet<String>,
    pub non_strict_features: BTreeSet<String>,
}

impl FirmwareKey {
    /// A device can run this family if type, model and strict features
    /// match exactly and every non-strict feature it has is provided.
    pub fn fits(&self, device: &DeviceState) -> bool {
        self.device_type == device.device_type
            && self.model_type == device.model_type
            && self.strict_features == device.strict_features
            && device.non_strict_features.is_subset(&self.non_strict_features)
    }
}

impl fmt::Display for FirmwareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_type, self.model_type)?;
        if !self.strict_features.is_empty() {
            let features: Vec<_> = self.strict_features.iter().map(String::as_str).collect();
            write!(f, "[{}]", features.join(","))?;
        }
        Ok(())
    }
}

// ── Versions ─────────────────────────────────────────────────────────

/// Caller-supplied firmware image, already parsed into its key and level.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub key: FirmwareKey,
    pub level: FirmwareLevel,
    pub blob: Bytes,
    pub timestamp: DateTime<Utc>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub key: FirmwareKey,
    pub level: FirmwareLevel,
    pub blob: Bytes,
    pub timestamp: DateTime<Utc>,
    pub comment: String,
}

impl From<FirmwareImage> for FirmwareVersion {
    fn from(image: FirmwareImage) -> Self {
        Self {
            key: image.key,
            level: image.level,
            blob: image.blob,
            timestamp: image.timestamp,
            comment: image.comment,
        }
    }
}

/// All versions of one family.
#[derive(Debug, Clone)]
pub struct Firmware {
    pub key: FirmwareKey,
    pub versions: Vec<Arc<FirmwareVersion>>,
}

impl Firmware {
    pub fn best_version(&self) -> Option<&Arc<FirmwareVersion>> {
        self.versions.iter().max_by(|a, b| a.level.cmp(&b.level))
    }

    pub fn version(&self, level: &FirmwareLevel) -> Option<&Arc<FirmwareVersion>> {
        self.versions.iter().find(|v| &v.level == level)
    }
}

// ── FirmwareStore ────────────────────────────────────────────────────

/// Outcome of [`FirmwareStore::insert`].
#[derive(Debug)]
pub struct Inserted {
    pub version: Arc<FirmwareVersion>,
    /// `true` if this created the family.
    pub new_family: bool,
    /// Versions dropped to stay within the retention limit.
    pub trimmed: Vec<Arc<FirmwareVersion>>,
}

pub struct FirmwareStore {
    lock: EntityLock,
    families: ArcSwap<IndexMap<FirmwareKey, Firmware>>,
}

impl FirmwareStore {
    pub fn new() -> Self {
        Self {
            lock: EntityLock::new("firmware"),
            families: ArcSwap::from_pointee(IndexMap::new()),
        }
    }

    pub fn lock(&self) -> &EntityLock {
        &self.lock
    }

    pub fn families(&self) -> Vec<Firmware> {
        self.families.load().values().cloned().collect()
    }

    pub fn family(&self, key: &FirmwareKey) -> Option<Firmware> {
        self.families.load().get(key).cloned()
    }

    /// Every family `device` can run.
    pub fn compatible(&self, device: &DeviceState) -> Vec<Firmware> {
        self.families
            .load()
            .values()
            .filter(|fw| fw.key.fits(device))
            .cloned()
            .collect()
    }

    /// Highest level across all families that fit `device`.
    pub fn best_for(&self, device: &DeviceState) -> Option<Arc<FirmwareVersion>> {
        self.compatible(device)
            .iter()
            .filter_map(Firmware::best_version)
            .max_by(|a, b| a.level.cmp(&b.level))
            .cloned()
    }

    /// Add a version, trimming the oldest (by timestamp) past `max_versions`.
    /// A version that would be trimmed itself is rejected.
    pub fn insert(
        &self,
        guard: &LockGuard,
        version: FirmwareVersion,
        max_versions: usize,
    ) -> Result<Inserted, CoreError> {
        debug_assert!(guard.guards(&self.lock));
        let mut families = IndexMap::clone(&self.families.load());
        let new_family = !families.contains_key(&version.key);
        let family = families
            .entry(version.key.clone())
            .or_insert_with(|| Firmware {
                key: version.key.clone(),
                versions: Vec::new(),
            });
        if family.version(&version.level).is_some() {
            return Err(CoreError::AlreadyExists {
                entity_type: "FirmwareVersion".into(),
                identifier: format!("{} {}", version.key, version.level),
            });
        }

        let version = Arc::new(version);
        family.versions.push(Arc::clone(&version));
        family.versions.sort_by_key(|v| v.timestamp);
        let excess = family.versions.len().saturating_sub(max_versions.max(1));
        let trimmed: Vec<_> = family.versions.drain(..excess).collect();
        if trimmed.iter().any(|v| Arc::ptr_eq(v, &version)) {
            return Err(CoreError::validation(format!(
                "firmware {} {} is older than every retained version",
                version.key, version.level
            )));
        }

        self.families.store(Arc::new(families));
        Ok(Inserted {
            version,
            new_family,
            trimmed,
        })
    }

    /// Remove one version. Returns `true` if its family became empty and
    /// was dropped too.
    pub fn remove(
        &self,
        guard: &LockGuard,
        key: &FirmwareKey,
        level: &FirmwareLevel,
    ) -> Result<bool, CoreError> {
        debug_assert!(guard.guards(&self.lock));
        let mut families = IndexMap::clone(&self.families.load());
        let Some(family) = families.get_mut(key) else {
            return Err(CoreError::not_found("Firmware", key.to_string()));
        };
        let before = family.versions.len();
        family.versions.retain(|v| &v.level != level);
        if family.versions.len() == before {
            return Err(CoreError::not_found(
                "FirmwareVersion",
                format!("{key} {level}"),
            ));
        }
        let emptied = family.versions.is_empty();
        if emptied {
            families.shift_remove(key);
        }
        self.families.store(Arc::new(families));
        Ok(emptied)
    }

    /// Install families wholesale while restoring from persisted records.
    pub(crate) fn restore(&self, families: Vec<Firmware>) {
        let map = families.into_iter().map(|f| (f.key.clone(), f)).collect();
        self.families.store(Arc::new(map));
    }
}

impl Default for FirmwareStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FirmwareStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareStore")
            .field("families", &self.families.load().len())
            .finish_non_exhaustive()
    }
}
