// ── Device ──

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use fleetsync_api::{DeviceContext, DeviceMetaInfo};

use crate::lock::{EntityLock, LockGuard};

/// Management status of a device or of its firmware.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ManagementStatus {
    #[default]
    Unknown,
    /// Last contact attempt failed.
    Unreachable,
    /// Managed, not yet confirmed by a heartbeat or synchronization.
    Pending,
    /// Rebooting or installing firmware.
    InProgress,
    Synced,
    Error,
    /// Not a member of any managed set.
    Unmanaged,
}

impl ManagementStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::InProgress)
    }
}

/// Mutable view of a device. Replaced wholesale on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub device_type: String,
    pub model_type: String,
    pub firmware_level: String,
    pub hostname: Option<String>,
    pub strict_features: BTreeSet<String>,
    pub non_strict_features: BTreeSet<String>,
    pub reachable: bool,
    pub device_status: ManagementStatus,
    pub firmware_status: ManagementStatus,
    /// Domains last seen on the device, managed or not.
    pub domain_names: BTreeSet<String>,
    pub managed_set: Option<String>,
    pub subscription: Option<Uuid>,
    pub tags: BTreeSet<String>,
}

impl DeviceState {
    pub fn from_meta(meta: &DeviceMetaInfo) -> Self {
        Self {
            device_type: meta.device_type.clone(),
            model_type: meta.model_type.clone(),
            firmware_level: meta.firmware_level.clone(),
            hostname: meta.hostname.clone(),
            strict_features: meta.strict_features.clone(),
            non_strict_features: meta.non_strict_features.clone(),
            reachable: true,
            device_status: ManagementStatus::Unmanaged,
            firmware_status: ManagementStatus::Unmanaged,
            domain_names: BTreeSet::new(),
            managed_set: None,
            subscription: None,
            tags: BTreeSet::new(),
        }
    }

    /// Copy identity-independent facts reported by the device.
    pub fn apply_meta(&mut self, meta: &DeviceMetaInfo) {
        self.model_type.clone_from(&meta.model_type);
        self.firmware_level.clone_from(&meta.firmware_level);
        self.hostname.clone_from(&meta.hostname);
        self.strict_features.clone_from(&meta.strict_features);
        self.non_strict_features.clone_from(&meta.non_strict_features);
    }

    /// Mid-reboot or mid-firmware-update.
    pub fn is_busy_on_device(&self) -> bool {
        self.device_status.is_in_progress() || self.firmware_status.is_in_progress()
    }
}

/// A managed appliance. Identity (serial, connection context) is fixed;
/// everything else lives in [`DeviceState`] and is only written while
/// holding the device lock.
pub struct Device {
    serial: String,
    context: DeviceContext,
    lock: EntityLock,
    state: ArcSwap<DeviceState>,
}

impl Device {
    pub fn new(serial: impl Into<String>, context: DeviceContext, state: DeviceState) -> Self {
        let serial = serial.into();
        Self {
            lock: EntityLock::new(format!("device {serial}")),
            serial,
            context,
            state: ArcSwap::from_pointee(state),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn lock(&self) -> &EntityLock {
        &self.lock
    }

    pub fn state(&self) -> Arc<DeviceState> {
        self.state.load_full()
    }

    pub fn managed_set(&self) -> Option<String> {
        self.state.load().managed_set.clone()
    }

    /// Apply `f` to a copy of the state and publish it.
    pub fn modify(&self, guard: &LockGuard, f: impl FnOnce(&mut DeviceState)) -> Arc<DeviceState> {
        debug_assert!(
            guard.guards(&self.lock),
            "{} modified under {}",
            self.lock.name(),
            guard.lock_name()
        );
        let mut next = DeviceState::clone(&self.state.load());
        f(&mut next);
        let next = Arc::new(next);
        self.state.store(Arc::clone(&next));
        next
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.serial)
            .field("address", &self.context.address())
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}
