// ── Notification dispatch ──
//
// Runs on the queue processor for every released notification. A
// notification is a hint that something changed: handlers re-read device
// state instead of trusting the payload, and a sequence gap is answered
// with a full compare-and-resync of the device.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use fleetsync_api::{DEFAULT_DOMAIN, Notification, NotificationKind};

use crate::error::CoreError;
use crate::manager::Manager;
use crate::model::{Device, Domain, DomainKey, SyncMode};
use crate::persistence::{DomainRecord, Record};
use crate::progress::ProgressContainer;
use crate::queue::{Released, WorkAreaId};
use crate::sync;
use crate::task::{BackgroundTask, SyncTarget, TaskKind};

pub(crate) async fn handle_notification(
    manager: &Manager,
    area: &WorkAreaId,
    released: Released<Notification>,
) {
    let in_sequence = released.is_in_sequence();
    let notification = released.item;
    let device = match manager.registry().device(&notification.serial) {
        Ok(device) => device,
        Err(e) => {
            debug!(serial = %notification.serial, error = %e, "notification from unmanaged device dropped");
            return;
        }
    };
    trace!(
        work_area = %area,
        serial = %notification.serial,
        sequence = notification.sequence,
        kind = ?notification.kind,
        "handling notification"
    );

    if !in_sequence {
        info!(
            serial = %device.serial(),
            sequence = notification.sequence,
            "notification sequence gap, resynchronizing device"
        );
        let progress = ProgressContainer::new(format!("Resynchronizing {}", device.serial()));
        if let Err(e) = sync::synchronize_device(manager, &device, true, &progress).await {
            warn!(serial = %device.serial(), error = %e, "resynchronization after gap failed");
        }
    }

    let result = match &notification.kind {
        NotificationKind::OperationalStateChange { domain } => {
            refresh_status(manager, &device, domain).await
        }
        NotificationKind::SaveConfig { domain } => {
            saved(manager, &device, domain, !in_sequence).await
        }
        NotificationKind::SaveSettings => saved(manager, &device, DEFAULT_DOMAIN, !in_sequence).await,
        NotificationKind::Test => {
            debug!(serial = %device.serial(), "test notification acknowledged");
            Ok(())
        }
        NotificationKind::Unknown => {
            debug!(serial = %device.serial(), "unknown notification ignored");
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(
            serial = %device.serial(),
            sequence = notification.sequence,
            error = %e,
            "notification handling failed"
        );
    }
}

async fn refresh_status(manager: &Manager, device: &Device, name: &str) -> Result<(), CoreError> {
    let key = DomainKey::new(device.serial(), name);
    let Ok(domain) = manager.registry().domain(&key) else {
        trace!(domain = %key, "status change of unmanaged domain");
        return Ok(());
    };
    crate::task::refresh_status(manager, &domain).await?;
    Ok(())
}

/// A domain was saved on `device`. Compare it against the last deployed
/// version, restore vanished domains on a save of the default domain, and
/// flag domains elsewhere that are sourced from this one.
async fn saved(
    manager: &Manager,
    device: &Arc<Device>,
    name: &str,
    already_resynced: bool,
) -> Result<(), CoreError> {
    let key = DomainKey::new(device.serial(), name);
    let mut first_error = None;

    if !already_resynced {
        if let Ok(domain) = manager.registry().domain(&key) {
            let progress = ProgressContainer::new(format!("Checking {key}"));
            if let Err(e) = sync::synchronize_domain(manager, &domain, true, &progress).await {
                first_error.get_or_insert(e);
            }
        }
    }

    if name == DEFAULT_DOMAIN {
        if let Err(e) = restore_missing(manager, device).await {
            first_error.get_or_insert(e);
        }
    }

    if let Err(e) = propagate(manager, &key).await {
        first_error.get_or_insert(e);
    }
    first_error.map_or(Ok(()), Err)
}

/// Redeploy managed domains the device no longer reports. Every missing
/// domain is attempted; the first failure is returned.
async fn restore_missing(manager: &Manager, device: &Arc<Device>) -> Result<(), CoreError> {
    let present = manager
        .client()
        .get_domain_presence(device.context())
        .await?;
    let missing: Vec<Arc<Domain>> = manager
        .registry()
        .domains_of(device.serial())
        .into_iter()
        .filter(|d| d.name() != DEFAULT_DOMAIN && !present.iter().any(|p| p == d.name()))
        .collect();

    let mut first_error = None;
    for domain in missing {
        info!(domain = %domain.key(), "managed domain missing from device, restoring");
        let progress = ProgressContainer::new(format!("Restoring {}", domain.key()));
        let restored = async {
            mark_out_of_synch(manager, &domain).await?;
            sync::synchronize_domain(manager, &domain, false, &progress).await
        }
        .await;
        if let Err(e) = restored {
            warn!(domain = %domain.key(), error = %e, "domain restore failed, continuing");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Flag auto-synchronized domains on other managed devices whose source is
/// the running configuration of `origin`, and queue their synchronization.
async fn propagate(manager: &Manager, origin: &DomainKey) -> Result<(), CoreError> {
    let dependents: Vec<Arc<Domain>> = manager
        .registry()
        .domains_named(&origin.name)
        .into_iter()
        .filter(|d| d.device().serial() != origin.serial)
        .filter(|d| d.device().managed_set().is_some())
        .filter(|d| {
            let state = d.state();
            state.mode == SyncMode::Auto
                && state.source.as_ref().is_some_and(|s| s.references(origin))
        })
        .collect();

    for domain in dependents {
        debug!(domain = %domain.key(), origin = %origin, "source changed, marking out of synch");
        mark_out_of_synch(manager, &domain).await?;
        let task = BackgroundTask::new(TaskKind::Synchronize {
            target: SyncTarget::Domain(Arc::clone(&domain)),
            compare: false,
        })
        .coalescing(format!("sync:{}", domain.key()));
        if let Err(e) = manager
            .work_area_for(domain.device())
            .enqueue_coalesced(task)
            .await
        {
            debug!(domain = %domain.key(), error = %e, "synchronization not queued, timer will pick it up");
        }
    }
    Ok(())
}

async fn mark_out_of_synch(manager: &Manager, domain: &Domain) -> Result<(), CoreError> {
    let guard = domain.device().lock().lock_wait().await;
    domain.modify(&guard, |s| s.out_of_synch = true);
    manager
        .repository()
        .update(Record::Domain(DomainRecord::from_domain(domain)))
        .await?;
    drop(guard);
    Ok(())
}
