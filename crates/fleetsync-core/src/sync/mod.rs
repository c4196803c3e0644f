// ── Domain synchronization ──
//
// Decides whether a domain must be redeployed and drives the deploy with a
// bounded retry budget. A domain that keeps failing is demoted to manual
// mode so the timers stop hammering the device.

pub(crate) mod deploy;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use strum::Display;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, ErrorKind};
use crate::manager::Manager;
use crate::model::{ConfigSource, Device, Domain, DomainKey, DomainState, SyncMode};
use crate::persistence::{DomainRecord, Record};
use crate::progress::ProgressContainer;
use crate::source;

/// Why a synchronization pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    ManualMode,
    /// Device is rebooting or installing firmware.
    DeviceBusy,
    /// The domain was removed while the pass was queued.
    Deleted,
    /// Nothing to deploy from yet.
    NoSource,
}

/// Result of one [`synchronize_domain`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    /// Nothing to do.
    InSync,
    /// A deploy was needed but the device lock was taken; a later pass
    /// retries.
    Deferred,
    Deployed { version: u32 },
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
            Self::InSync => f.write_str("in sync"),
            Self::Deferred => f.write_str("deferred"),
            Self::Deployed { version } => write!(f, "deployed version {version}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
enum DeployReason {
    LiveDiffers,
    NoVersions,
    SynchFailed,
    OutOfSynch,
    SourceChanged,
    PolicyChanged,
}

/// Run one synchronization pass over `domain`.
///
/// `compare` asks for a live comparison against the latest version. Busy
/// devices defer rather than fail. Deploy failures consume the retry
/// budget; the last one demotes the domain to manual and yields
/// `Undeployable`. A policy mismatch is returned as is and leaves the
/// budget untouched.
pub(crate) async fn synchronize_domain(
    manager: &Manager,
    domain: &Arc<Domain>,
    compare: bool,
    progress: &ProgressContainer,
) -> Result<SyncOutcome, CoreError> {
    let key = domain.key();
    match manager.registry().domain(&key) {
        Ok(current) if Arc::ptr_eq(&current, domain) => {}
        Ok(_) | Err(_) => {
            debug!(domain = %key, "domain removed before synchronization, skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::Deleted));
        }
    }

    let state = domain.state();
    if state.mode != SyncMode::Auto {
        return Ok(SyncOutcome::Skipped(SkipReason::ManualMode));
    }
    if domain.device().state().is_busy_on_device() {
        debug!(domain = %key, "device rebooting or updating firmware, skipping");
        return Ok(SyncOutcome::Skipped(SkipReason::DeviceBusy));
    }
    if state.source.is_none() {
        debug!(domain = %key, "no source configuration, skipping");
        return Ok(SyncOutcome::Skipped(SkipReason::NoSource));
    }

    progress.increment_current_step(1, format!("Checking {key}"));

    let mut compare_driven = false;
    let mut reason = None;
    if compare || domain.compare_failed() {
        match live_reason(manager, domain, &state).await {
            Ok(found) => {
                domain.set_compare_failed(false);
                compare_driven = found.is_some();
                reason = found;
            }
            Err(e) => {
                debug!(domain = %key, error = %e, "live comparison failed, retrying next pass");
                domain.set_compare_failed(true);
            }
        }
    }
    if reason.is_none() {
        reason = flag_reason(&state);
    }
    if reason.is_none() {
        reason = timestamp_reason(manager, &key, &state).await;
    }
    let Some(reason) = reason else {
        return Ok(SyncOutcome::InSync);
    };

    let guard = match domain.device().lock().lock_no_wait() {
        Ok(guard) => guard,
        Err(busy) => {
            debug!(domain = %key, reason = %reason, error = %busy, "deploy deferred");
            if compare_driven {
                domain.note(|s| s.synch_failed = true);
            }
            return Ok(SyncOutcome::Deferred);
        }
    };

    info!(domain = %key, reason = %reason, "synchronizing domain");
    let result = deploy::deploy_locked(manager, domain, &guard, progress).await;

    let outcome = match result {
        Ok(version) => Ok(SyncOutcome::Deployed { version }),
        // Fatal for this attempt only: no flag, no retry budget.
        Err(e) if e.kind() == ErrorKind::PolicyMismatch => {
            warn!(domain = %key, error = %e, "deployment policy does not match source version");
            Err(e)
        }
        Err(e) => Err(record_failure(manager, domain, &guard, e).await),
    };
    drop(guard);
    manager.save_unforced().await;
    outcome
}

/// Count one failed attempt. Returns the error to surface.
async fn record_failure(
    manager: &Manager,
    domain: &Domain,
    guard: &crate::lock::LockGuard,
    err: CoreError,
) -> CoreError {
    let key = domain.key();
    let max = manager.config().max_synch_retry_count.max(1);
    let state = domain.modify(guard, |s| {
        s.retry_count += 1;
        s.synch_failed = true;
        if s.retry_count >= max {
            s.mode = SyncMode::Manual;
        }
    });
    if let Err(e) = manager
        .repository()
        .update(Record::Domain(DomainRecord::from_domain(domain)))
        .await
    {
        warn!(domain = %key, error = %e, "failed to persist synchronization failure");
    }

    if state.retry_count >= max {
        error!(
            domain = %key,
            attempts = state.retry_count,
            error = %err,
            "synchronization retries exhausted, domain set to manual"
        );
        CoreError::Undeployable {
            domain: key.to_string(),
            attempts: state.retry_count,
            last_error: err.to_string(),
        }
    } else {
        warn!(
            domain = %key,
            attempt = state.retry_count,
            max,
            error = %err,
            "synchronization attempt failed"
        );
        err
    }
}

async fn live_reason(
    manager: &Manager,
    domain: &Domain,
    state: &DomainState,
) -> Result<Option<DeployReason>, CoreError> {
    let Some(latest) = state.latest_version() else {
        return Ok(Some(DeployReason::NoVersions));
    };
    let differs = manager
        .client()
        .is_different_from(
            domain.device().context(),
            domain.name(),
            latest.blob.clone(),
        )
        .await?;
    Ok(differs.then_some(DeployReason::LiveDiffers))
}

fn flag_reason(state: &DomainState) -> Option<DeployReason> {
    if state.synch_failed {
        Some(DeployReason::SynchFailed)
    } else if state.out_of_synch {
        Some(DeployReason::OutOfSynch)
    } else if state.versions.is_empty() {
        Some(DeployReason::NoVersions)
    } else {
        None
    }
}

async fn timestamp_reason(
    manager: &Manager,
    key: &DomainKey,
    state: &DomainState,
) -> Option<DeployReason> {
    if let Some(source) = &state.source {
        match source_timestamp(manager, source).await {
            Ok(Some(ts)) if Some(ts) != state.source_timestamp => {
                return Some(DeployReason::SourceChanged);
            }
            Ok(_) => {}
            Err(e) => debug!(domain = %key, error = %e, "source timestamp unavailable"),
        }
    }
    if let Some(policy) = &state.policy {
        match source::timestamp(manager, &policy.source).await {
            Ok(Some(ts)) if Some(ts) != state.policy_timestamp => {
                return Some(DeployReason::PolicyChanged);
            }
            Ok(_) => {}
            Err(e) => debug!(domain = %key, error = %e, "policy timestamp unavailable"),
        }
    }
    None
}

async fn source_timestamp(
    manager: &Manager,
    source: &ConfigSource,
) -> Result<Option<DateTime<Utc>>, CoreError> {
    match source {
        ConfigSource::Url { url } => source::timestamp(manager, url).await,
        ConfigSource::Version { domain, number } => {
            let referenced = manager.registry().domain(domain)?;
            Ok(referenced.state().version(*number).map(|v| v.timestamp))
        }
    }
}

/// Synchronize every managed domain of `device`. Each domain is attempted
/// even if an earlier one failed; the first failure is returned.
pub(crate) async fn synchronize_device(
    manager: &Manager,
    device: &Arc<Device>,
    compare: bool,
    progress: &ProgressContainer,
) -> Result<Vec<(DomainKey, SyncOutcome)>, CoreError> {
    let domains = manager.registry().domains_of(device.serial());
    progress.increment_total_steps(u32::try_from(domains.len()).unwrap_or(u32::MAX));

    let mut outcomes = Vec::with_capacity(domains.len());
    let mut first_error = None;
    for domain in domains {
        match synchronize_domain(manager, &domain, compare, progress).await {
            Ok(outcome) => outcomes.push((domain.key(), outcome)),
            Err(e) => {
                if e.kind() != ErrorKind::Busy {
                    debug!(domain = %domain.key(), error = %e, "domain synchronization failed");
                }
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(outcomes),
    }
}
