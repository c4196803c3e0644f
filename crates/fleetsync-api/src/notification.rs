//! Device-originated notifications.
//!
//! Devices push a notification whenever something the manager may care
//! about happens (a domain was saved, its operational state flipped, ...).
//! Each carries a per-device sequence number so the receiver can restore
//! delivery order. Notifications are wake-up hints: a lost one is recovered
//! by a full reconciliation, never by replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Name of the domain every device always carries.
pub const DEFAULT_DOMAIN: &str = "default";

/// What happened on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    /// A domain changed operational state (up/down, quiesced, ...).
    OperationalStateChange { domain: String },
    /// The configuration of a domain was saved on the device.
    SaveConfig { domain: String },
    /// Device-wide settings were saved.
    SaveSettings,
    /// Liveness probe sent by the device right after subscribing.
    Test,
    /// Anything this version does not know about.
    #[serde(other)]
    Unknown,
}

/// A single notification as delivered by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Serial number of the device that emitted the notification.
    pub serial: String,
    /// Per-device, monotonically increasing sequence number.
    pub sequence: u64,
    #[serde(flatten)]
    pub kind: NotificationKind,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(serial: impl Into<String>, sequence: u64, kind: NotificationKind) -> Self {
        Self {
            serial: serial.into(),
            sequence,
            kind,
            timestamp: None,
        }
    }

    /// Decode a JSON notification body.
    pub fn from_json(body: &str) -> Result<Self, Error> {
        serde_json::from_str(body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: body.to_owned(),
        })
    }

    /// Domain the notification refers to, if any.
    pub fn domain(&self) -> Option<&str> {
        match &self.kind {
            NotificationKind::OperationalStateChange { domain }
            | NotificationKind::SaveConfig { domain } => Some(domain),
            NotificationKind::SaveSettings | NotificationKind::Test | NotificationKind::Unknown => {
                None
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_save_config() {
        let n = Notification::from_json(
            r#"{"serial":"A1B2C3","sequence":7,"type":"save_config","domain":"payments"}"#,
        )
        .unwrap();
        assert_eq!(
            n,
            Notification::new(
                "A1B2C3",
                7,
                NotificationKind::SaveConfig {
                    domain: "payments".into()
                }
            )
        );
        assert_eq!(n.domain(), Some("payments"));
    }

    #[test]
    fn decodes_unit_kinds() {
        let n = Notification::from_json(r#"{"serial":"X","sequence":1,"type":"test"}"#).unwrap();
        assert_eq!(n.kind, NotificationKind::Test);
        assert_eq!(n.domain(), None);
    }

    #[test]
    fn unknown_kind_is_tolerated() {
        let n =
            Notification::from_json(r#"{"serial":"X","sequence":2,"type":"log_rotated"}"#).unwrap();
        assert_eq!(n.kind, NotificationKind::Unknown);
    }

    #[test]
    fn malformed_body_is_a_deserialization_error() {
        let err = Notification::from_json(r#"{"serial":"X"}"#).unwrap_err();
        assert!(matches!(err, Error::Deserialization { .. }));
    }
}
