// ── Managed entity model ──
//
// Devices, managed sets, domains and firmware. Identity fields are plain
// immutable members; mutable state sits behind `ArcSwap` so readers never
// block, while writers serialize on the owning entity's lock.

pub mod device;
pub mod domain;
pub mod firmware;
pub mod managed_set;

pub use device::{Device, DeviceState, ManagementStatus};
pub use domain::{
    ConfigSource, DEVICE_SCHEME, DeploymentPolicy, DeploymentPolicyVersion, Domain, DomainKey,
    DomainState, DomainVersion, SyncMode, trim_versions,
};
pub use firmware::{
    Firmware, FirmwareImage, FirmwareKey, FirmwareLevel, FirmwareStore, FirmwareVersion,
};
pub use managed_set::ManagedSet;
