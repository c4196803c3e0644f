// ── Device command contract ──
//
// The narrow capability `fleetsync-core` needs from whatever speaks the
// device management protocol. Implementations own framing, encoding and
// connection handling; the core only sees typed requests and results.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::Error;

// ── Connection context ───────────────────────────────────────────────

/// Where and how to reach one device's management interface.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

impl DeviceContext {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password,
        }
    }

    /// `host:port`, used in log fields and error messages.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Device metadata ──────────────────────────────────────────────────

/// Identity and capability report returned by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetaInfo {
    pub serial: String,
    pub device_type: String,
    pub model_type: String,
    /// Dotted firmware level, e.g. `"3.8.1.4"`.
    pub firmware_level: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub strict_features: BTreeSet<String>,
    #[serde(default)]
    pub non_strict_features: BTreeSet<String>,
}

// ── Domain status ────────────────────────────────────────────────────

/// Operational state of a domain as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum OperationalState {
    Up,
    Down,
    Unknown,
}

/// Quiesce progress of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum QuiesceState {
    Normal,
    Quiescing,
    Quiesced,
    Unquiescing,
    Error,
    Unknown,
}

/// Live status of one domain on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStatus {
    pub operational: OperationalState,
    pub quiesce: QuiesceState,
    /// The running configuration differs from the saved one.
    #[serde(default)]
    pub unsaved_changes: bool,
}

impl DomainStatus {
    pub fn unknown() -> Self {
        Self {
            operational: OperationalState::Unknown,
            quiesce: QuiesceState::Unknown,
            unsaved_changes: false,
        }
    }
}

// ── Deploy payloads ──────────────────────────────────────────────────

/// Deployment policy pushed together with a domain configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyPayload {
    pub blob: Bytes,
    /// Domain inside the policy export that holds the policy object.
    pub domain: String,
    pub policy_name: String,
}

// ── Diff ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum DiffChange {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Object path inside the configuration, e.g. `"XMLFirewallService/fw1"`.
    pub path: String,
    pub change: DiffChange,
}

/// Result of comparing two configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    pub entries: Vec<DiffEntry>,
}

impl DiffReport {
    pub fn is_identical(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Subscriptions ────────────────────────────────────────────────────

/// Request to have a device push notifications to a callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub id: Uuid,
    pub callback: String,
}

/// Device answer to a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Active,
    /// Another manager already holds a subscription on this device.
    Duplicate,
}

// ── DeviceCommandClient ──────────────────────────────────────────────

/// Remote operations the manager performs against a device.
///
/// All methods may fail with [`Error::Transport`], [`Error::Timeout`],
/// [`Error::Credentials`] or [`Error::RemoteExecution`]; callers treat
/// those as retryable by the next scheduled pass.
#[async_trait]
pub trait DeviceCommandClient: Send + Sync {
    async fn get_device_meta_info(&self, ctx: &DeviceContext) -> Result<DeviceMetaInfo, Error>;

    async fn ping_device(&self, ctx: &DeviceContext) -> Result<(), Error>;

    /// Names of all domains currently present on the device.
    async fn get_domain_presence(&self, ctx: &DeviceContext) -> Result<Vec<String>, Error>;

    async fn get_domain_status(
        &self,
        ctx: &DeviceContext,
        domain: &str,
    ) -> Result<DomainStatus, Error>;

    /// Ask the device to quiesce a domain. Returns once the request is
    /// accepted; completion is observed via [`get_domain_status`](Self::get_domain_status).
    async fn quiesce_domain(
        &self,
        ctx: &DeviceContext,
        domain: &str,
        timeout: Duration,
    ) -> Result<(), Error>;

    async fn unquiesce_domain(&self, ctx: &DeviceContext, domain: &str) -> Result<(), Error>;

    /// Push a configuration (and optional deployment policy) as one
    /// atomic remote operation.
    async fn deploy_domain(
        &self,
        ctx: &DeviceContext,
        domain: &str,
        config: Bytes,
        policy: Option<PolicyPayload>,
    ) -> Result<(), Error>;

    /// Export the running configuration of a domain.
    async fn export_domain(&self, ctx: &DeviceContext, domain: &str) -> Result<Bytes, Error>;

    async fn delete_domain(&self, ctx: &DeviceContext, domain: &str) -> Result<(), Error>;

    /// Compare the running domain against a previously deployed blob.
    async fn is_different_from(
        &self,
        ctx: &DeviceContext,
        domain: &str,
        saved: Bytes,
    ) -> Result<bool, Error>;

    async fn get_diff(
        &self,
        ctx: &DeviceContext,
        from: Bytes,
        to: Bytes,
    ) -> Result<DiffReport, Error>;

    async fn subscribe(
        &self,
        ctx: &DeviceContext,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionState, Error>;

    async fn unsubscribe(&self, ctx: &DeviceContext, id: Uuid) -> Result<(), Error>;

    /// Install a firmware image. The device reboots afterwards.
    async fn deploy_firmware(
        &self,
        ctx: &DeviceContext,
        image: Bytes,
        accept_license: bool,
    ) -> Result<(), Error>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn quiesce_state_parses_case_insensitively() {
        let state: QuiesceState = "Quiesced".parse().unwrap();
        assert_eq!(state, QuiesceState::Quiesced);
        assert_eq!(QuiesceState::Unquiescing.to_string(), "unquiescing");
    }

    #[test]
    fn meta_info_defaults_optional_fields() {
        let raw = r#"{
            "serial": "A1B2C3",
            "device_type": "9235",
            "model_type": "XI52",
            "firmware_level": "3.8.1.4"
        }"#;
        let info: DeviceMetaInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.serial, "A1B2C3");
        assert!(info.hostname.is_none());
        assert!(info.strict_features.is_empty());
    }

    #[test]
    fn context_address_joins_host_and_port() {
        let ctx = DeviceContext::new("10.1.1.5", 5550, "admin", SecretString::from("pw".to_string()));
        assert_eq!(ctx.address(), "10.1.1.5:5550");
    }
}
