// ── Domain, DomainVersion and their configuration sources ──

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

use fleetsync_api::DomainStatus;

use super::Device;
use crate::error::CoreError;
use crate::lock::LockGuard;

/// URL scheme for sourcing a domain from another managed device.
pub const DEVICE_SCHEME: &str = "device";

// ── Identity ─────────────────────────────────────────────────────────

/// Primary key of a domain: owning device plus domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainKey {
    pub serial: String,
    pub name: String,
}

impl DomainKey {
    pub fn new(serial: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.serial, self.name)
    }
}

// ── Sources ──────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SyncMode {
    #[default]
    Manual,
    Auto,
}

/// Where a domain's desired configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigSource {
    /// `file://`, `http(s)://` or `device://<serial>/<domain>`.
    Url { url: Url },
    /// An existing version of some managed domain.
    Version { domain: DomainKey, number: u32 },
}

impl ConfigSource {
    pub fn parse(url: &str) -> Result<Self, CoreError> {
        let url = Url::parse(url)
            .map_err(|e| CoreError::validation(format!("invalid source URL {url}: {e}")))?;
        Ok(Self::Url { url })
    }

    pub fn from_device(serial: &str, domain: &str) -> Result<Self, CoreError> {
        Self::parse(&format!("{DEVICE_SCHEME}://{serial}/{domain}"))
    }

    /// The `(serial, domain)` a `device://` source points at.
    pub fn device_reference(&self) -> Option<DomainKey> {
        match self {
            Self::Url { url } => device_reference(url),
            Self::Version { .. } => None,
        }
    }

    /// Whether this source reads the running configuration of `key`.
    pub fn references(&self, key: &DomainKey) -> bool {
        self.device_reference().is_some_and(|r| &r == key)
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url { url } => write!(f, "{url}"),
            Self::Version { domain, number } => write!(f, "version {number} of {domain}"),
        }
    }
}

pub(crate) fn device_reference(url: &Url) -> Option<DomainKey> {
    if url.scheme() != DEVICE_SCHEME {
        return None;
    }
    let serial = url.host_str()?;
    let name = url.path().trim_matches('/');
    if serial.is_empty() || name.is_empty() {
        return None;
    }
    Some(DomainKey::new(serial, name))
}

/// Deployment policy fetched alongside the configuration and applied in the
/// same remote deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPolicy {
    pub source: Url,
    /// Domain inside the policy export that carries the policy.
    pub domain: String,
    pub policy_name: String,
}

/// Snapshot of the policy deployed with one [`DomainVersion`]. Shares the
/// version's timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPolicyVersion {
    pub domain: String,
    pub policy_name: String,
    pub blob: Bytes,
    pub timestamp: DateTime<Utc>,
}

// ── Versions ─────────────────────────────────────────────────────────

/// Immutable record of one successful deploy. Only `comment` may change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainVersion {
    pub number: u32,
    pub blob: Bytes,
    pub timestamp: DateTime<Utc>,
    pub comment: String,
    pub policy: Option<DeploymentPolicyVersion>,
}

impl DomainVersion {
    /// The linked policy must carry the version's own timestamp.
    pub fn validate_policy(&self, domain: &str) -> Result<(), CoreError> {
        match &self.policy {
            Some(policy) if policy.timestamp != self.timestamp => Err(CoreError::PolicyMismatch {
                domain: domain.to_owned(),
            }),
            _ => Ok(()),
        }
    }
}

/// Drop the oldest versions until at most `max` remain. Returns the dropped
/// versions, oldest first.
pub fn trim_versions(versions: &mut Vec<DomainVersion>, max: usize) -> Vec<DomainVersion> {
    versions.sort_by_key(|v| v.number);
    let excess = versions.len().saturating_sub(max);
    versions.drain(..excess).collect()
}

// ── Domain ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainState {
    pub mode: SyncMode,
    pub out_of_synch: bool,
    pub synch_failed: bool,
    pub retry_count: u32,
    pub quiesce_timeout: Duration,
    pub source: Option<ConfigSource>,
    pub policy: Option<DeploymentPolicy>,
    /// Source timestamp recorded at the last successful deploy.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Policy timestamp recorded at the last successful deploy.
    pub policy_timestamp: Option<DateTime<Utc>>,
    /// Ascending by version number.
    pub versions: Vec<DomainVersion>,
    /// Last observed runtime status; not persisted.
    pub status: DomainStatus,
}

impl DomainState {
    pub fn new(quiesce_timeout: Duration) -> Self {
        Self {
            mode: SyncMode::Manual,
            out_of_synch: false,
            synch_failed: false,
            retry_count: 0,
            quiesce_timeout,
            source: None,
            policy: None,
            source_timestamp: None,
            policy_timestamp: None,
            versions: Vec::new(),
            status: DomainStatus::unknown(),
        }
    }

    pub fn latest_version(&self) -> Option<&DomainVersion> {
        self.versions.iter().max_by_key(|v| v.number)
    }

    pub fn version(&self, number: u32) -> Option<&DomainVersion> {
        self.versions.iter().find(|v| v.number == number)
    }

    pub fn next_version_number(&self) -> u32 {
        self.latest_version().map_or(1, |v| v.number + 1)
    }
}

/// A configuration partition on one device.
pub struct Domain {
    device: Arc<Device>,
    name: String,
    state: ArcSwap<DomainState>,
    /// The last live comparison errored; the next pass compares again.
    compare_failed: AtomicBool,
}

impl Domain {
    pub fn new(device: Arc<Device>, name: impl Into<String>, state: DomainState) -> Self {
        Self {
            device,
            name: name.into(),
            state: ArcSwap::from_pointee(state),
            compare_failed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn key(&self) -> DomainKey {
        DomainKey::new(self.device.serial(), &self.name)
    }

    pub fn state(&self) -> Arc<DomainState> {
        self.state.load_full()
    }

    /// Mutate persisted state. Caller holds the owning device's lock.
    pub fn modify(&self, guard: &LockGuard, f: impl Fn(&mut DomainState)) -> Arc<DomainState> {
        debug_assert!(
            guard.guards(self.device.lock()),
            "domain {} modified under {}",
            self.key(),
            guard.lock_name()
        );
        self.apply(f)
    }

    /// Record a flag or observation without the device lock.
    ///
    /// Used for bookkeeping that must survive a failed fail-fast lock
    /// attempt; the next locked write persists it.
    pub(crate) fn note(&self, f: impl Fn(&mut DomainState)) -> Arc<DomainState> {
        self.apply(f)
    }

    fn apply(&self, f: impl Fn(&mut DomainState)) -> Arc<DomainState> {
        self.state.rcu(|current| {
            let mut next = DomainState::clone(current);
            f(&mut next);
            next
        });
        self.state.load_full()
    }

    pub fn compare_failed(&self) -> bool {
        self.compare_failed.load(Ordering::Acquire)
    }

    pub(crate) fn set_compare_failed(&self, failed: bool) {
        self.compare_failed.store(failed, Ordering::Release);
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("key", &self.key())
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn version(number: u32) -> DomainVersion {
        DomainVersion {
            number,
            blob: Bytes::from_static(b"cfg"),
            timestamp: Utc::now(),
            comment: String::new(),
            policy: None,
        }
    }

    #[test]
    fn trim_keeps_newest() {
        let mut versions: Vec<_> = (1..=5).map(version).collect();
        let dropped = trim_versions(&mut versions, 3);

        let kept: Vec<_> = versions.iter().map(|v| v.number).collect();
        let gone: Vec<_> = dropped.iter().map(|v| v.number).collect();
        assert_eq!(kept, [3, 4, 5]);
        assert_eq!(gone, [1, 2]);
    }

    #[test]
    fn trim_below_limit_is_noop() {
        let mut versions = vec![version(1)];
        assert!(trim_versions(&mut versions, 3).is_empty());
        assert_eq!(versions.len(), 1);
    }

    #[test]
    fn next_version_follows_highest() {
        let mut state = DomainState::new(Duration::from_secs(60));
        assert_eq!(state.next_version_number(), 1);
        state.versions = vec![version(4), version(7)];
        assert_eq!(state.next_version_number(), 8);
    }

    #[test]
    fn device_source_reference() {
        let source = ConfigSource::from_device("A1", "billing").unwrap();
        assert_eq!(source.device_reference(), Some(DomainKey::new("A1", "billing")));
        assert!(source.references(&DomainKey::new("A1", "billing")));
        assert!(!source.references(&DomainKey::new("B2", "billing")));

        let http = ConfigSource::parse("https://configs.example.com/billing.zip").unwrap();
        assert!(http.device_reference().is_none());
    }

    #[test]
    fn policy_timestamp_must_match_version() {
        let mut v = version(1);
        v.policy = Some(DeploymentPolicyVersion {
            domain: "billing".into(),
            policy_name: "prod".into(),
            blob: Bytes::new(),
            timestamp: v.timestamp,
        });
        assert!(v.validate_policy("billing").is_ok());

        if let Some(p) = v.policy.as_mut() {
            p.timestamp = v.timestamp + chrono::Duration::seconds(1);
        }
        let err = v.validate_policy("billing").unwrap_err();
        assert!(matches!(err, CoreError::PolicyMismatch { .. }));
    }

    #[test]
    fn sync_mode_parses() {
        assert_eq!("AUTO".parse::<SyncMode>().unwrap(), SyncMode::Auto);
        assert_eq!(SyncMode::Manual.to_string(), "manual");
    }
}
