// ── Firmware install ──
//
// Holds the device lock for the whole install: push the image, then poll
// the device through its reboot until it reports the new level or the
// install timeout passes. Both status fields read `in_progress` meanwhile,
// which makes synchronization and heartbeats leave the device alone.

use std::sync::Arc;

use tracing::{debug, info, warn};

use fleetsync_api::DeviceMetaInfo;

use crate::error::CoreError;
use crate::lock::LockGuard;
use crate::manager::Manager;
use crate::model::{Device, DeviceState, FirmwareLevel, FirmwareVersion, ManagementStatus};
use crate::persistence::{DeviceRecord, Record};
use crate::progress::{ProgressContainer, TaskOutput};
use crate::timer::{PollEnd, PollSchedule};

pub(super) async fn deploy(
    manager: &Manager,
    device: &Arc<Device>,
    version: &Arc<FirmwareVersion>,
    accept_license: bool,
    progress: &ProgressContainer,
) -> Result<TaskOutput, CoreError> {
    let guard = device.lock().lock_wait().await;
    manager.registry().device(device.serial())?;

    let before = device.state();
    if !version.key.fits(&before) {
        return Err(CoreError::validation(format!(
            "firmware {} for {} does not fit device {}",
            version.level,
            version.key,
            device.serial()
        )));
    }

    progress.set_total_steps(2);
    progress.increment_current_step(1, format!("Installing firmware {} on {}", version.level, device.serial()));
    device.modify(&guard, |s| {
        s.firmware_status = ManagementStatus::InProgress;
        s.device_status = ManagementStatus::InProgress;
    });

    let result = install(manager, device, version, accept_license, progress).await;
    finish(manager, device, &guard, &before, &result).await;
    drop(guard);

    let meta = result?;
    info!(serial = %device.serial(), level = %meta.firmware_level, "firmware installed");
    Ok(TaskOutput::FirmwareInstalled {
        level: meta.firmware_level,
    })
}

async fn install(
    manager: &Manager,
    device: &Device,
    version: &FirmwareVersion,
    accept_license: bool,
    progress: &ProgressContainer,
) -> Result<DeviceMetaInfo, CoreError> {
    let client = manager.client();
    client
        .deploy_firmware(device.context(), version.blob.clone(), accept_license)
        .await?;

    progress.increment_current_step(1, format!("Waiting for {} to restart", device.serial()));
    let config = manager.config();
    let schedule = PollSchedule::new(config.firmware_deploy_timeout, config.firmware_poll_interval);
    let cancel = manager.cancel_token();
    loop {
        match schedule.tick(&cancel).await {
            Ok(()) => {}
            Err(PollEnd::Expired) => {
                return Err(CoreError::Timeout {
                    operation: format!("firmware install on {}", device.serial()),
                    timeout_secs: schedule.timeout().as_secs(),
                });
            }
            Err(PollEnd::Cancelled) => {
                return Err(CoreError::ShutdownDiscarded {
                    task: format!("firmware install on {}", device.serial()),
                });
            }
        }

        let meta = match client.get_device_meta_info(device.context()).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!(serial = %device.serial(), error = %e, "device not answering yet");
                continue;
            }
        };
        match meta.firmware_level.parse::<FirmwareLevel>() {
            Ok(level) if level == version.level => return Ok(meta),
            Ok(level) => {
                debug!(serial = %device.serial(), reported = %level, wanted = %version.level, "old level still running");
            }
            Err(e) => debug!(serial = %device.serial(), error = %e, "unparsable firmware level"),
        }
    }
}

async fn finish(
    manager: &Manager,
    device: &Device,
    guard: &LockGuard,
    before: &DeviceState,
    result: &Result<DeviceMetaInfo, CoreError>,
) {
    let managed = before.managed_set.is_some();
    match result {
        Ok(meta) => {
            device.modify(guard, |s| {
                s.apply_meta(meta);
                s.reachable = true;
                s.firmware_status = ManagementStatus::Synced;
                s.device_status = if managed {
                    ManagementStatus::Synced
                } else {
                    ManagementStatus::Unmanaged
                };
            });
            if let Err(e) = manager
                .repository()
                .update(Record::Device(DeviceRecord::from_device(device)))
                .await
            {
                warn!(serial = %device.serial(), error = %e, "failed to persist new firmware level");
            }
        }
        Err(e) => {
            warn!(serial = %device.serial(), error = %e, "firmware install failed");
            device.modify(guard, |s| {
                s.firmware_status = ManagementStatus::Error;
                s.device_status = before.device_status;
            });
        }
    }
}
