// ── Background tasks ──
//
// Units of work executed by the queue processor. Each task owns a
// `ProgressContainer`; the caller that enqueued it keeps a clone. Tasks
// never return errors to the processor: failures land in the container.

mod device;
mod domain;
mod firmware;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CoreError, ErrorKind};
use crate::manager::Manager;
use crate::model::{Device, Domain, FirmwareVersion};
use crate::progress::{ProgressContainer, TaskOutput};

pub use domain::DiffSide;
pub(crate) use domain::refresh_status;

/// Scope of a synchronization task.
#[derive(Debug, Clone)]
pub enum SyncTarget {
    Domain(Arc<Domain>),
    /// Every managed domain of the device.
    Device(Arc<Device>),
}

/// What a task does, with the entities it targets.
#[derive(Debug, Clone)]
pub enum TaskKind {
    DeployDomain {
        domain: Arc<Domain>,
    },
    Synchronize {
        target: SyncTarget,
        compare: bool,
    },
    Subscribe {
        device: Arc<Device>,
    },
    Unsubscribe {
        device: Arc<Device>,
    },
    /// Final task of a shutdown: drop every device subscription.
    UnsubscribeAll,
    GetDiff {
        domain: Arc<Domain>,
        left: DiffSide,
        right: DiffSide,
    },
    GetOperationStatus {
        domain: Arc<Domain>,
    },
    Heartbeat {
        device: Arc<Device>,
    },
    DeployFirmware {
        device: Arc<Device>,
        version: Arc<FirmwareVersion>,
        accept_license: bool,
    },
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeployDomain { domain } => write!(f, "deploy {}", domain.key()),
            Self::Synchronize {
                target: SyncTarget::Domain(domain),
                ..
            } => write!(f, "synchronize {}", domain.key()),
            Self::Synchronize {
                target: SyncTarget::Device(device),
                ..
            } => write!(f, "synchronize device {}", device.serial()),
            Self::Subscribe { device } => write!(f, "subscribe {}", device.serial()),
            Self::Unsubscribe { device } => write!(f, "unsubscribe {}", device.serial()),
            Self::UnsubscribeAll => f.write_str("unsubscribe all"),
            Self::GetDiff { domain, .. } => write!(f, "diff {}", domain.key()),
            Self::GetOperationStatus { domain } => write!(f, "status of {}", domain.key()),
            Self::Heartbeat { device } => write!(f, "heartbeat {}", device.serial()),
            Self::DeployFirmware {
                device, version, ..
            } => write!(f, "firmware {} to {}", version.level, device.serial()),
        }
    }
}

pub struct BackgroundTask {
    kind: TaskKind,
    progress: ProgressContainer,
    coalescing_key: Option<String>,
}

impl BackgroundTask {
    pub fn new(kind: TaskKind) -> Self {
        let progress = ProgressContainer::new(format!("Queued: {kind}"));
        Self {
            kind,
            progress,
            coalescing_key: None,
        }
    }

    /// Tag the task so timers do not enqueue a duplicate while it waits.
    pub fn coalescing(mut self, key: impl Into<String>) -> Self {
        self.coalescing_key = Some(key.into());
        self
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn progress(&self) -> &ProgressContainer {
        &self.progress
    }

    pub fn coalescing_key(&self) -> Option<&str> {
        self.coalescing_key.as_deref()
    }

    pub fn describe(&self) -> String {
        self.kind.to_string()
    }

    /// Mandatory tasks bypass the work-area bound.
    pub fn is_privileged(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::Unsubscribe { .. } | TaskKind::UnsubscribeAll
        )
    }

    pub(crate) fn runs_during_shutdown(&self) -> bool {
        matches!(self.kind, TaskKind::UnsubscribeAll)
    }

    /// Fail the task without running it.
    pub(crate) fn discard(self) -> CoreError {
        let err = CoreError::ShutdownDiscarded {
            task: self.describe(),
        };
        self.progress.set_error(err.clone());
        err
    }

    /// Fail the task because its work area went away.
    pub(crate) fn abandon(self, err: CoreError) {
        debug!(task = %self.describe(), error = %err, "task abandoned");
        self.progress.set_error(err);
    }

    /// Run to completion. The outcome is staged while entity locks are held
    /// and published once they are released.
    pub(crate) async fn execute(self, manager: &Manager) {
        let Self { kind, progress, .. } = self;
        let label = kind.to_string();
        let result = run(manager, kind, &progress).await;

        match result {
            Ok(output) => progress.set_uncommitted_complete_with(output),
            Err(e) => {
                match e.kind() {
                    ErrorKind::Busy | ErrorKind::Deleted => {
                        debug!(task = %label, error = %e, "task did not run");
                    }
                    _ => warn!(task = %label, error = %e, "task failed"),
                }
                progress.set_uncommitted_error(e);
            }
        }
        progress.commit();
    }
}

async fn run(
    manager: &Manager,
    kind: TaskKind,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    match kind {
        TaskKind::DeployDomain { domain } => domain::deploy(manager, &domain, progress).await,
        TaskKind::Synchronize { target, compare } => {
            domain::synchronize(manager, target, compare, progress).await
        }
        TaskKind::Subscribe { device } => device::subscribe(manager, &device, progress).await,
        TaskKind::Unsubscribe { device } => device::unsubscribe(manager, &device, progress).await,
        TaskKind::UnsubscribeAll => device::unsubscribe_all(manager, progress).await,
        TaskKind::GetDiff {
            domain,
            left,
            right,
        } => domain::diff(manager, &domain, &left, &right, progress).await,
        TaskKind::GetOperationStatus { domain } => {
            domain::operation_status(manager, &domain, progress).await
        }
        TaskKind::Heartbeat { device } => device::heartbeat(manager, &device, progress).await,
        TaskKind::DeployFirmware {
            device,
            version,
            accept_license,
        } => firmware::deploy(manager, &device, &version, accept_license, progress).await,
    }
}

impl fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("kind", &self.describe())
            .field("progress", &self.progress.id())
            .field("coalescing_key", &self.coalescing_key)
            .finish()
    }
}
