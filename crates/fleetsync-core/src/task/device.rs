// ── Device tasks ──

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetsync_api::{DeviceMetaInfo, SubscriptionRequest, SubscriptionState};

use crate::error::CoreError;
use crate::lock::LockGuard;
use crate::manager::Manager;
use crate::model::{Device, ManagementStatus};
use crate::persistence::{DeviceRecord, Record};
use crate::progress::{ProgressContainer, TaskOutput};
use crate::queue::WorkAreaId;

use super::{BackgroundTask, SyncTarget, TaskKind};

pub(super) async fn subscribe(
    manager: &Manager,
    device: &Arc<Device>,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    let guard = device.lock().lock_wait().await;
    manager.registry().device(device.serial())?;
    progress.increment_current_step(1, format!("Subscribing to {}", device.serial()));

    let request = SubscriptionRequest {
        id: Uuid::new_v4(),
        callback: manager.config().notification_callback.clone(),
    };
    let state = manager
        .client()
        .subscribe(device.context(), &request)
        .await?;
    match state {
        SubscriptionState::Active => {
            device.modify(&guard, |s| s.subscription = Some(request.id));
            info!(serial = %device.serial(), subscription = %request.id, "subscribed to notifications");
        }
        SubscriptionState::Duplicate => {
            warn!(serial = %device.serial(), "device already has a subscription from another manager");
        }
    }
    drop(guard);

    manager
        .work_area_for(device)
        .reset_notification_source(device.serial())
        .await;
    Ok(TaskOutput::Subscribed(state))
}

pub(super) async fn unsubscribe(
    manager: &Manager,
    device: &Device,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    let guard = device.lock().lock_wait().await;
    progress.increment_current_step(1, format!("Unsubscribing from {}", device.serial()));
    let result = unsubscribe_locked(manager, device, &guard).await;
    drop(guard);

    // Removal already retired the device's area; this task re-created it.
    if manager.registry().device(device.serial()).is_err() {
        manager
            .retire_area(
                WorkAreaId::Device(device.serial().to_owned()),
                CoreError::deleted("Device", device.serial()),
            )
            .await;
    }
    result.map(|()| TaskOutput::Done)
}

async fn unsubscribe_locked(
    manager: &Manager,
    device: &Device,
    guard: &LockGuard,
) -> Result<(), CoreError> {
    let Some(id) = device.state().subscription else {
        debug!(serial = %device.serial(), "no subscription to drop");
        return Ok(());
    };
    manager.client().unsubscribe(device.context(), id).await?;
    device.modify(guard, |s| s.subscription = None);
    debug!(serial = %device.serial(), subscription = %id, "unsubscribed");
    Ok(())
}

/// Drop every subscription. Failures are logged and skipped so one
/// unreachable device does not keep the others subscribed.
pub(super) async fn unsubscribe_all(
    manager: &Manager,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    let devices: Vec<_> = manager
        .registry()
        .devices
        .values()
        .iter()
        .filter(|d| d.state().subscription.is_some())
        .cloned()
        .collect();
    progress.set_total_steps(u32::try_from(devices.len()).unwrap_or(u32::MAX));

    for device in devices {
        progress.increment_current_step(1, format!("Unsubscribing from {}", device.serial()));
        let guard = device.lock().lock_wait().await;
        if let Err(e) = unsubscribe_locked(manager, &device, &guard).await {
            warn!(serial = %device.serial(), error = %e, "unsubscribe failed, continuing");
        }
    }
    Ok(TaskOutput::Done)
}

/// Confirm the device still answers and is still the same appliance.
///
/// A busy device is skipped. A device whose serial or type changed is
/// removed from management entirely.
pub(super) async fn heartbeat(
    manager: &Manager,
    device: &Arc<Device>,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    let guard = match device.lock().lock_no_wait() {
        Ok(guard) => guard,
        Err(busy) => {
            debug!(serial = %device.serial(), error = %busy, "device busy, skipping heartbeat");
            return Ok(TaskOutput::Done);
        }
    };
    manager.registry().device(device.serial())?;
    progress.increment_current_step(1, format!("Contacting {}", device.serial()));

    let previous = device.state();
    let (meta, presence) = match probe(manager, device).await {
        Ok(found) => found,
        Err(e) => {
            if previous.reachable {
                warn!(serial = %device.serial(), error = %e, "device unreachable");
            }
            device.modify(&guard, |s| {
                s.reachable = false;
                s.device_status = ManagementStatus::Unreachable;
            });
            return Err(e);
        }
    };

    if meta.serial != device.serial() || meta.device_type != previous.device_type {
        drop(guard);
        let err = CoreError::StructuralMismatch {
            serial: device.serial().to_owned(),
            detail: format!(
                "device at {} now reports serial {} type {} (was type {})",
                device.context().address(),
                meta.serial,
                meta.device_type,
                previous.device_type
            ),
        };
        warn!(error = %err, "removing device from management");
        manager.purge_device(device).await;
        return Err(err);
    }

    let managed = previous.managed_set.is_some();
    let state = device.modify(&guard, |s| {
        s.apply_meta(&meta);
        s.reachable = true;
        s.domain_names = presence;
        if !s.device_status.is_in_progress() {
            s.device_status = if managed {
                ManagementStatus::Synced
            } else {
                ManagementStatus::Unmanaged
            };
        }
    });
    let meta_changed = state.firmware_level != previous.firmware_level
        || state.model_type != previous.model_type
        || state.hostname != previous.hostname
        || state.strict_features != previous.strict_features
        || state.non_strict_features != previous.non_strict_features;
    if meta_changed {
        manager
            .repository()
            .update(Record::Device(DeviceRecord::from_device(device)))
            .await?;
    }
    drop(guard);

    if !previous.reachable && managed {
        info!(serial = %device.serial(), "device reachable again, resubscribing");
        recover(manager, device).await;
    }
    Ok(TaskOutput::Done)
}

async fn probe(
    manager: &Manager,
    device: &Device,
) -> Result<(DeviceMetaInfo, BTreeSet<String>), CoreError> {
    let timeout = manager.config().heartbeat_timeout;
    let client = manager.client();
    let timed_out = || CoreError::Timeout {
        operation: format!("heartbeat of {}", device.serial()),
        timeout_secs: timeout.as_secs(),
    };

    let meta = tokio::time::timeout(timeout, client.get_device_meta_info(device.context()))
        .await
        .map_err(|_| timed_out())??;
    let presence = tokio::time::timeout(timeout, client.get_domain_presence(device.context()))
        .await
        .map_err(|_| timed_out())??;
    Ok((meta, presence.into_iter().collect()))
}

/// Resubscribe and check every domain after the device comes back.
async fn recover(manager: &Manager, device: &Arc<Device>) {
    let area = manager.work_area_for(device);
    let tasks = [
        BackgroundTask::new(TaskKind::Subscribe {
            device: Arc::clone(device),
        })
        .coalescing(format!("subscribe:{}", device.serial())),
        BackgroundTask::new(TaskKind::Synchronize {
            target: SyncTarget::Device(Arc::clone(device)),
            compare: true,
        })
        .coalescing(format!("sync:{}", device.serial())),
    ];
    for task in tasks {
        if let Err(e) = area.enqueue_coalesced(task).await {
            debug!(serial = %device.serial(), error = %e, "recovery task not queued");
        }
    }
}
