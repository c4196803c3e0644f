//! Background task queue and synchronization engine for appliance fleets.
//!
//! Everything that mutates a device runs through one serial dispatcher:
//!
//! - **[`Manager`]**: Central facade. Foreground operations validate, take
//!   the owning entity lock fail-fast, mutate and persist, then enqueue
//!   follow-up work. [`start()`](Manager::start) spawns the queue processor,
//!   heartbeat and synchronization timers and the notification pump;
//!   [`shutdown()`](Manager::shutdown) drains them.
//!
//! - **Work dispatch** ([`queue`]): One bounded task queue and one
//!   reordering notification queue per [`WorkArea`] (a device, or the
//!   managed set it belongs to), visited round-robin by a single processor.
//!
//! - **Synchronization** ([`sync`]): Decides whether a domain must be
//!   redeployed, runs the quiesce/deploy/unquiesce protocol and demotes
//!   domains to manual mode once the retry budget is spent.
//!
//! - **Progress** ([`progress`]): Every queued operation hands back a
//!   [`ProgressContainer`]; multi-device operations a
//!   [`MacroProgressContainer`].
//!
//! - **Domain model** ([`model`]) and **persistence contract**
//!   ([`persistence`]): Devices, managed sets, domains and firmware, plus the
//!   [`Repository`] trait they are saved through.

mod dispatch;

pub mod config;
pub mod error;
pub mod lock;
pub mod manager;
pub mod model;
pub mod persistence;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod source;
pub mod sync;
pub mod task;
pub mod timer;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::ManagerConfig;
pub use error::{CoreError, ErrorKind};
pub use lock::{EntityLock, LockGuard};
pub use manager::Manager;
pub use persistence::{InMemoryRepository, Record, RecordKey, Repository, SaveMode};
pub use progress::{
    MacroProgressContainer, ProgressContainer, ProgressSnapshot, ProgressWatcher, TaskOutput,
};
pub use queue::{ProcessorState, WorkArea, WorkAreaId};
pub use registry::Registry;
pub use source::SourceFetcher;
pub use sync::{SkipReason, SyncOutcome};
pub use task::{BackgroundTask, DiffSide, SyncTarget, TaskKind};

pub use model::{
    ConfigSource, DeploymentPolicy, Device, DeviceState, Domain, DomainKey, DomainState,
    DomainVersion, Firmware, FirmwareImage, FirmwareKey, FirmwareLevel, FirmwareVersion,
    ManagedSet, ManagementStatus, SyncMode,
};
