// ── Domain tasks ──

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::CoreError;
use crate::manager::Manager;
use crate::model::{ConfigSource, Domain};
use crate::progress::{ProgressContainer, TaskOutput};
use crate::source;
use crate::sync::{self, deploy};

use super::SyncTarget;

/// One side of a configuration diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffSide {
    /// A recorded version of the domain.
    Version(u32),
    /// What is running on the device right now.
    Device,
    /// What the domain's source currently holds.
    Source,
}

/// Explicit deploy. Waits for the device lock.
pub(super) async fn deploy(
    manager: &Manager,
    domain: &Arc<Domain>,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    let guard = domain.device().lock().lock_wait().await;
    manager.registry().domain(&domain.key())?;

    let result = deploy::deploy_locked(manager, domain, &guard, progress).await;
    drop(guard);
    manager.save_unforced().await;
    result.map(|version| TaskOutput::Deployed { version })
}

pub(super) async fn synchronize(
    manager: &Manager,
    target: SyncTarget,
    compare: bool,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    match target {
        SyncTarget::Domain(domain) => {
            progress.increment_total_steps(1);
            sync::synchronize_domain(manager, &domain, compare, progress)
                .await
                .map(TaskOutput::Synchronized)
        }
        SyncTarget::Device(device) => {
            manager.registry().device(device.serial())?;
            let outcomes = sync::synchronize_device(manager, &device, compare, progress).await?;
            debug!(serial = %device.serial(), domains = outcomes.len(), "device synchronized");
            Ok(TaskOutput::Done)
        }
    }
}

pub(super) async fn diff(
    manager: &Manager,
    domain: &Domain,
    left: &DiffSide,
    right: &DiffSide,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    progress.set_total_steps(3);
    progress.increment_current_step(1, format!("Reading {left:?} of {}", domain.key()));
    let from = side_bytes(manager, domain, left).await?;
    progress.increment_current_step(1, format!("Reading {right:?} of {}", domain.key()));
    let to = side_bytes(manager, domain, right).await?;
    progress.increment_current_step(1, "Comparing");
    let report = manager
        .client()
        .get_diff(domain.device().context(), from, to)
        .await?;
    Ok(TaskOutput::Diff(report))
}

async fn side_bytes(
    manager: &Manager,
    domain: &Domain,
    side: &DiffSide,
) -> Result<Bytes, CoreError> {
    match side {
        DiffSide::Version(number) => domain
            .state()
            .version(*number)
            .map(|v| v.blob.clone())
            .ok_or_else(|| CoreError::not_found("DomainVersion", format!("{} #{number}", domain.key()))),
        DiffSide::Device => Ok(manager
            .client()
            .export_domain(domain.device().context(), domain.name())
            .await?),
        DiffSide::Source => match domain.state().source.clone() {
            Some(ConfigSource::Url { url }) => Ok(source::fetch(manager, &url).await?.bytes),
            Some(ConfigSource::Version {
                domain: origin,
                number,
            }) => {
                let referenced = manager.registry().domain(&origin)?;
                referenced
                    .state()
                    .version(number)
                    .map(|v| v.blob.clone())
                    .ok_or_else(|| {
                        CoreError::not_found("DomainVersion", format!("{origin} #{number}"))
                    })
            }
            None => Err(CoreError::validation(format!(
                "domain {} has no source configuration",
                domain.key()
            ))),
        },
    }
}

pub(super) async fn operation_status(
    manager: &Manager,
    domain: &Domain,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    progress.increment_current_step(1, format!("Reading status of {}", domain.key()));
    let status = refresh_status(manager, domain).await?;
    Ok(TaskOutput::Status(status))
}

/// Fetch and store the live status of a domain.
pub(crate) async fn refresh_status(
    manager: &Manager,
    domain: &Domain,
) -> Result<fleetsync_api::DomainStatus, CoreError> {
    let status = manager
        .client()
        .get_domain_status(domain.device().context(), domain.name())
        .await?;
    domain.note(|s| s.status = status.clone());
    Ok(status)
}
