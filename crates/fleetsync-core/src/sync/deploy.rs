// ── Deploy / quiesce protocol ──
//
// Runs with the device lock held:
//   1. validate the linked policy version (version sources only)
//   2. fetch configuration and policy bytes
//   3. quiesce, if the domain exists and the firmware supports it
//   4. push configuration + policy in one remote call
//   5. record a new DomainVersion and the source/policy timestamps
//   6. unquiesce, on success and failure alike
// The caller releases the lock and issues the unforced save.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use fleetsync_api::{PolicyPayload, QuiesceState};

use crate::error::CoreError;
use crate::lock::LockGuard;
use crate::manager::Manager;
use crate::model::{
    ConfigSource, DeploymentPolicyVersion, Domain, DomainState, DomainVersion, FirmwareLevel,
    trim_versions,
};
use crate::persistence::{DomainRecord, DomainVersionRecord, Record, RecordKey};
use crate::progress::ProgressContainer;
use crate::source::{self, Fetched};
use crate::timer::{PollEnd, PollSchedule};

const DEPLOY_STEPS: u32 = 4;

/// Everything pushed to the device in one deploy.
struct Payload {
    config: Fetched,
    policy: Option<(PolicyPayload, Option<DateTime<Utc>>)>,
}

/// Deploy `domain` from its configured source. Returns the new version
/// number.
pub(crate) async fn deploy_locked(
    manager: &Manager,
    domain: &Domain,
    guard: &LockGuard,
    progress: &ProgressContainer,
) -> Result<u32, CoreError> {
    let key = domain.key();
    let state = domain.state();
    progress.increment_total_steps(DEPLOY_STEPS);

    let source = state
        .source
        .clone()
        .ok_or_else(|| CoreError::validation(format!("domain {key} has no source configuration")))?;
    progress.increment_current_step(1, format!("Fetching configuration from {source}"));
    let payload = resolve_payload(manager, domain, &state, &source).await?;

    let quiesce = quiesce_supported(manager, domain).await?;
    let mut quiesce_requested = false;
    let result = async {
        if quiesce {
            progress.increment_current_step(1, format!("Quiescing {key}"));
            quiesce_requested = true;
            quiesce_domain(manager, domain, state.quiesce_timeout).await?;
        } else {
            progress.increment_current_step(1, format!("{key} does not need quiescing"));
        }

        progress.increment_current_step(1, format!("Deploying {key}"));
        manager
            .client()
            .deploy_domain(
                domain.device().context(),
                domain.name(),
                payload.config.bytes.clone(),
                payload.policy.as_ref().map(|(p, _)| p.clone()),
            )
            .await?;

        progress.increment_current_step(1, format!("Recording new version of {key}"));
        record_version(manager, domain, guard, &state, &payload).await
    }
    .await;

    if quiesce_requested {
        if let Err(e) = manager
            .client()
            .unquiesce_domain(domain.device().context(), domain.name())
            .await
        {
            warn!(domain = %key, error = %e, "unquiesce failed");
        }
    }

    match &result {
        Ok(version) => info!(domain = %key, version, "domain deployed"),
        Err(e) => debug!(domain = %key, error = %e, "domain deploy failed"),
    }
    result
}

async fn resolve_payload(
    manager: &Manager,
    domain: &Domain,
    state: &DomainState,
    source: &ConfigSource,
) -> Result<Payload, CoreError> {
    match source {
        ConfigSource::Url { url } => {
            let config = source::fetch(manager, url).await?;
            let policy = match &state.policy {
                Some(policy) => {
                    let fetched = source::fetch(manager, &policy.source).await?;
                    Some((
                        PolicyPayload {
                            blob: fetched.bytes,
                            domain: policy.domain.clone(),
                            policy_name: policy.policy_name.clone(),
                        },
                        fetched.timestamp,
                    ))
                }
                None => None,
            };
            Ok(Payload { config, policy })
        }
        ConfigSource::Version {
            domain: origin,
            number,
        } => {
            let referenced = manager.registry().domain(origin)?;
            let referenced_state = referenced.state();
            let version = referenced_state.version(*number).ok_or_else(|| {
                CoreError::not_found("DomainVersion", format!("{origin} #{number}"))
            })?;
            version.validate_policy(domain.name())?;
            if let (Some(wanted), Some(linked)) = (&state.policy, &version.policy) {
                if wanted.policy_name != linked.policy_name {
                    return Err(CoreError::PolicyMismatch {
                        domain: domain.key().to_string(),
                    });
                }
            }
            Ok(Payload {
                config: Fetched {
                    bytes: version.blob.clone(),
                    timestamp: Some(version.timestamp),
                },
                policy: version.policy.as_ref().map(|p| {
                    (
                        PolicyPayload {
                            blob: p.blob.clone(),
                            domain: p.domain.clone(),
                            policy_name: p.policy_name.clone(),
                        },
                        Some(p.timestamp),
                    )
                }),
            })
        }
    }
}

/// Quiesce only domains already on the device, and only on firmware that
/// knows how.
async fn quiesce_supported(manager: &Manager, domain: &Domain) -> Result<bool, CoreError> {
    let device = domain.device();
    let present = manager
        .client()
        .get_domain_presence(device.context())
        .await?
        .iter()
        .any(|name| name == domain.name());
    if !present {
        return Ok(false);
    }

    let firmware = device.state().firmware_level.parse::<FirmwareLevel>();
    let minimum = manager.config().min_firmware_for_quiesce.parse::<FirmwareLevel>();
    match (firmware, minimum) {
        (Ok(firmware), Ok(minimum)) => Ok(firmware >= minimum),
        (Err(e), _) | (_, Err(e)) => {
            debug!(serial = %device.serial(), error = %e, "cannot compare firmware levels, not quiescing");
            Ok(false)
        }
    }
}

/// Request quiesce and wait until the device reports it. A zero timeout
/// sends the request without waiting.
async fn quiesce_domain(
    manager: &Manager,
    domain: &Domain,
    timeout: Duration,
) -> Result<(), CoreError> {
    let ctx = domain.device().context();
    let client = manager.client();
    client.quiesce_domain(ctx, domain.name(), timeout).await?;
    if timeout.is_zero() {
        return Ok(());
    }

    let schedule = PollSchedule::new(timeout, manager.config().quiesce_poll_interval);
    let cancel = manager.cancel_token();
    loop {
        let status = client.get_domain_status(ctx, domain.name()).await?;
        match status.quiesce {
            QuiesceState::Quiesced => return Ok(()),
            QuiesceState::Error => {
                return Err(CoreError::RemoteExecution {
                    operation: format!("quiesce {}", domain.key()),
                    message: "device reported quiesce error".into(),
                });
            }
            other => debug!(domain = %domain.key(), state = %other, "waiting for quiesce"),
        }
        match schedule.tick(&cancel).await {
            Ok(()) => {}
            Err(PollEnd::Expired) => {
                return Err(CoreError::Timeout {
                    operation: format!("quiesce of {}", domain.key()),
                    timeout_secs: timeout.as_secs(),
                });
            }
            Err(PollEnd::Cancelled) => {
                return Err(CoreError::ShutdownDiscarded {
                    task: format!("quiesce of {}", domain.key()),
                });
            }
        }
    }
}

/// Snapshot the deployed configuration and persist the domain.
///
/// Storage is written first; memory only moves once every write went
/// through, so a failed write leaves both on the previous version.
async fn record_version(
    manager: &Manager,
    domain: &Domain,
    guard: &LockGuard,
    state: &DomainState,
    payload: &Payload,
) -> Result<u32, CoreError> {
    let key = domain.key();
    let timestamp = Utc::now();
    let version = DomainVersion {
        number: state.next_version_number(),
        blob: payload.config.bytes.clone(),
        timestamp,
        comment: String::new(),
        policy: payload.policy.as_ref().map(|(p, _)| DeploymentPolicyVersion {
            domain: p.domain.clone(),
            policy_name: p.policy_name.clone(),
            blob: p.blob.clone(),
            timestamp,
        }),
    };

    let mut versions = state.versions.clone();
    versions.push(version.clone());
    let trimmed = trim_versions(&mut versions, manager.config().max_domain_versions.max(1));

    let source_timestamp = payload.config.timestamp;
    let policy_timestamp = payload.policy.as_ref().and_then(|(_, ts)| *ts);
    let commit = |s: &mut DomainState| {
        s.versions.clone_from(&versions);
        s.out_of_synch = false;
        s.synch_failed = false;
        s.retry_count = 0;
        s.source_timestamp = source_timestamp;
        s.policy_timestamp = policy_timestamp;
    };
    let mut next = DomainState::clone(&domain.state());
    commit(&mut next);

    let repo = manager.repository();
    let version_key = RecordKey::DomainVersion(key.clone(), version.number);
    repo.create(Record::DomainVersion(DomainVersionRecord::from_version(
        &key, &version,
    )))
    .await?;
    let stored = async {
        for old in &trimmed {
            debug!(domain = %key, version = old.number, "trimming old version");
            repo.delete(&RecordKey::DomainVersion(key.clone(), old.number))
                .await?;
        }
        repo.update(Record::Domain(DomainRecord::from_state(domain, &next)))
            .await
    }
    .await;
    if let Err(e) = stored {
        if let Err(undo) = repo.delete(&version_key).await {
            warn!(domain = %key, version = version.number, error = %undo, "could not drop unrecorded version");
        }
        return Err(e);
    }

    domain.modify(guard, commit);
    Ok(version.number)
}
