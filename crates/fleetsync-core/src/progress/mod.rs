// ── Long-running operation tracking ──
//
// Every background task owns a `ProgressContainer`; callers hold a clone
// and observe it. Multi-device operations aggregate several containers in a
// `MacroProgressContainer`.

mod aggregate;
mod container;

use fleetsync_api::{DiffReport, DomainStatus, SubscriptionState};

pub use aggregate::MacroProgressContainer;
pub use container::{ProgressContainer, ProgressSnapshot, ProgressWatcher};

use crate::sync::SyncOutcome;

/// Result payload of a completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    /// Completed with nothing to report.
    Done,
    /// A domain configuration was pushed and recorded as this version.
    Deployed { version: u32 },
    Synchronized(SyncOutcome),
    Diff(DiffReport),
    Status(DomainStatus),
    FirmwareInstalled { level: String },
    Subscribed(SubscriptionState),
}
