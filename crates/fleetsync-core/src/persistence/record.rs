// ── Persisted record shapes ──
//
// Flat, serde-friendly mirrors of the in-memory model. Blobs are stored as
// plain byte vectors; credentials are stored in the clear, so repositories
// must sit on trusted storage.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use fleetsync_api::DeviceContext;

use crate::model::{
    ConfigSource, DeploymentPolicy, DeploymentPolicyVersion, Device, DeviceState, Domain,
    DomainKey, DomainState, DomainVersion, FirmwareKey, FirmwareLevel, FirmwareVersion,
    ManagementStatus, SyncMode,
};

/// One persisted row, of any type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Device(DeviceRecord),
    ManagedSet(ManagedSetRecord),
    Domain(DomainRecord),
    DomainVersion(DomainVersionRecord),
    Firmware(FirmwareRecord),
    FirmwareVersion(FirmwareVersionRecord),
    Tag(TagRecord),
}

/// Primary key of a [`Record`]. Variant order is restoration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    ManagedSet(String),
    Device(String),
    Domain(DomainKey),
    DomainVersion(DomainKey, u32),
    Firmware(FirmwareKey),
    FirmwareVersion(FirmwareKey, String),
    Tag { serial: String, tag: String },
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Device(r) => RecordKey::Device(r.serial.clone()),
            Self::ManagedSet(r) => RecordKey::ManagedSet(r.name.clone()),
            Self::Domain(r) => RecordKey::Domain(DomainKey::new(&r.serial, &r.name)),
            Self::DomainVersion(r) => {
                RecordKey::DomainVersion(DomainKey::new(&r.serial, &r.domain), r.number)
            }
            Self::Firmware(r) => RecordKey::Firmware(r.key.clone()),
            Self::FirmwareVersion(r) => RecordKey::FirmwareVersion(r.key.clone(), r.level.clone()),
            Self::Tag(r) => RecordKey::Tag {
                serial: r.serial.clone(),
                tag: r.tag.clone(),
            },
        }
    }
}

// ── Device / ManagedSet / Tag ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub serial: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(serialize_with = "expose_secret", deserialize_with = "wrap_secret")]
    pub password: SecretString,
    pub device_type: String,
    pub model_type: String,
    pub firmware_level: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub strict_features: BTreeSet<String>,
    #[serde(default)]
    pub non_strict_features: BTreeSet<String>,
    #[serde(default)]
    pub managed_set: Option<String>,
}

impl DeviceRecord {
    pub fn from_device(device: &Device) -> Self {
        let ctx = device.context();
        let state = device.state();
        Self {
            serial: device.serial().to_owned(),
            host: ctx.host.clone(),
            port: ctx.port,
            username: ctx.username.clone(),
            password: ctx.password.clone(),
            device_type: state.device_type.clone(),
            model_type: state.model_type.clone(),
            firmware_level: state.firmware_level.clone(),
            hostname: state.hostname.clone(),
            strict_features: state.strict_features.clone(),
            non_strict_features: state.non_strict_features.clone(),
            managed_set: state.managed_set.clone(),
        }
    }

    pub fn context(&self) -> DeviceContext {
        DeviceContext::new(&self.host, self.port, &self.username, self.password.clone())
    }

    /// State to restore with. Live facts (reachability, presence, the
    /// subscription) are left for the first heartbeat to fill in.
    pub fn state(&self) -> DeviceState {
        let status = if self.managed_set.is_some() {
            ManagementStatus::Pending
        } else {
            ManagementStatus::Unmanaged
        };
        DeviceState {
            device_type: self.device_type.clone(),
            model_type: self.model_type.clone(),
            firmware_level: self.firmware_level.clone(),
            hostname: self.hostname.clone(),
            strict_features: self.strict_features.clone(),
            non_strict_features: self.non_strict_features.clone(),
            reachable: true,
            device_status: status,
            firmware_status: status,
            domain_names: BTreeSet::new(),
            managed_set: self.managed_set.clone(),
            subscription: None,
            tags: BTreeSet::new(),
        }
    }
}

fn expose_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn wrap_secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedSetRecord {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRecord {
    pub serial: String,
    pub tag: String,
}

// ── Domain / DomainVersion ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub serial: String,
    pub name: String,
    pub mode: SyncMode,
    pub out_of_synch: bool,
    pub synch_failed: bool,
    pub retry_count: u32,
    pub quiesce_timeout_secs: u64,
    #[serde(default)]
    pub source: Option<ConfigSource>,
    #[serde(default)]
    pub policy: Option<DeploymentPolicy>,
    #[serde(default)]
    pub source_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub policy_timestamp: Option<DateTime<Utc>>,
}

impl DomainRecord {
    pub fn from_domain(domain: &Domain) -> Self {
        Self::from_state(domain, &domain.state())
    }

    /// Record for `state` as it would be on `domain`, before it is
    /// published.
    pub fn from_state(domain: &Domain, state: &DomainState) -> Self {
        Self {
            serial: domain.device().serial().to_owned(),
            name: domain.name().to_owned(),
            mode: state.mode,
            out_of_synch: state.out_of_synch,
            synch_failed: state.synch_failed,
            retry_count: state.retry_count,
            quiesce_timeout_secs: state.quiesce_timeout.as_secs(),
            source: state.source.clone(),
            policy: state.policy.clone(),
            source_timestamp: state.source_timestamp,
            policy_timestamp: state.policy_timestamp,
        }
    }

    /// Persisted part of the state; versions are attached separately.
    pub fn state(&self) -> DomainState {
        let mut state = DomainState::new(Duration::from_secs(self.quiesce_timeout_secs));
        state.mode = self.mode;
        state.out_of_synch = self.out_of_synch;
        state.synch_failed = self.synch_failed;
        state.retry_count = self.retry_count;
        state.source.clone_from(&self.source);
        state.policy.clone_from(&self.policy);
        state.source_timestamp = self.source_timestamp;
        state.policy_timestamp = self.policy_timestamp;
        state
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVersionRecord {
    pub domain: String,
    pub policy_name: String,
    pub blob: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainVersionRecord {
    pub serial: String,
    pub domain: String,
    pub number: u32,
    pub blob: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub policy: Option<PolicyVersionRecord>,
}

impl DomainVersionRecord {
    pub fn from_version(key: &DomainKey, version: &DomainVersion) -> Self {
        Self {
            serial: key.serial.clone(),
            domain: key.name.clone(),
            number: version.number,
            blob: version.blob.to_vec(),
            timestamp: version.timestamp,
            comment: version.comment.clone(),
            policy: version.policy.as_ref().map(|p| PolicyVersionRecord {
                domain: p.domain.clone(),
                policy_name: p.policy_name.clone(),
                blob: p.blob.to_vec(),
                timestamp: p.timestamp,
            }),
        }
    }

    pub fn version(&self) -> DomainVersion {
        DomainVersion {
            number: self.number,
            blob: Bytes::from(self.blob.clone()),
            timestamp: self.timestamp,
            comment: self.comment.clone(),
            policy: self.policy.as_ref().map(|p| DeploymentPolicyVersion {
                domain: p.domain.clone(),
                policy_name: p.policy_name.clone(),
                blob: Bytes::from(p.blob.clone()),
                timestamp: p.timestamp,
            }),
        }
    }
}

// ── Firmware ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareRecord {
    pub key: FirmwareKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareVersionRecord {
    pub key: FirmwareKey,
    pub level: String,
    pub blob: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub comment: String,
}

impl FirmwareVersionRecord {
    pub fn from_version(version: &FirmwareVersion) -> Self {
        Self {
            key: version.key.clone(),
            level: version.level.to_string(),
            blob: version.blob.to_vec(),
            timestamp: version.timestamp,
            comment: version.comment.clone(),
        }
    }

    pub fn version(&self) -> Result<FirmwareVersion, crate::error::CoreError> {
        Ok(FirmwareVersion {
            key: self.key.clone(),
            level: self.level.parse::<FirmwareLevel>()?,
            blob: Bytes::from(self.blob.clone()),
            timestamp: self.timestamp,
            comment: self.comment.clone(),
        })
    }
}
