#![allow(clippy::unwrap_used)]
// Domain synchronization end to end: source changes, retry exhaustion,
// lock contention and live drift, against the in-process fake fleet.

mod common;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use fleetsync_core::{
    ConfigSource, DeploymentPolicy, DiffSide, DomainKey, ErrorKind, Record, RecordKey, SkipReason,
    SyncMode, SyncOutcome, TaskOutput,
};

use common::{Harness, source_file};

const HOST: &str = "10.0.0.1";
const SERIAL: &str = "A1";

// ── Helpers ─────────────────────────────────────────────────────────

/// Started manager with one device and an automatic `billing` domain
/// already deployed once from a file source.
async fn deployed_domain(dir: &std::path::Path) -> (Harness, DomainKey) {
    let h = Harness::new();
    h.manager.start().await.unwrap();
    h.add_device(HOST, SERIAL).await;

    let key = DomainKey::new(SERIAL, "billing");
    h.manager.create_domain(SERIAL, "billing").await.unwrap();
    let url = source_file(dir, "billing.xml", "<billing v=\"1\"/>");
    let queued = h
        .manager
        .set_source_configuration(&key, ConfigSource::parse(&url).unwrap())
        .await
        .unwrap();
    assert!(queued.is_none(), "manual domains are not synchronized");

    let progress = h
        .manager
        .set_synchronization_mode(&key, SyncMode::Auto)
        .await
        .unwrap()
        .unwrap();
    let snap = progress.wait_for_end().await;
    assert!(snap.error.is_none(), "initial deploy failed: {:?}", snap.error);
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Deployed { version: 1 }))
    );
    (h, key)
}

// ── Source changes ──────────────────────────────────────────────────

#[tokio::test]
async fn new_source_is_deployed_and_flags_clear() {
    let dir = tempfile::tempdir().unwrap();
    let (h, key) = deployed_domain(dir.path()).await;

    let url = source_file(dir.path(), "billing-v2.xml", "<billing v=\"2\"/>");
    let progress = h
        .manager
        .set_source_configuration(&key, ConfigSource::parse(&url).unwrap())
        .await
        .unwrap()
        .unwrap();
    let snap = progress.wait_for_end().await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Deployed { version: 2 }))
    );

    let state = h.manager.domain(&key).unwrap().state();
    assert!(!state.out_of_synch);
    assert!(!state.synch_failed);
    assert_eq!(state.retry_count, 0);
    assert_eq!(
        state.versions.iter().map(|v| v.number).collect::<Vec<_>>(),
        [1, 2]
    );
    let running = h
        .fleet
        .with_device(HOST, |d| d.running.get("billing").cloned());
    assert_eq!(running, Some(Bytes::from_static(b"<billing v=\"2\"/>")));
}

#[tokio::test]
async fn unchanged_domain_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let (h, key) = deployed_domain(dir.path()).await;
    let deploys = h.fleet.count("deploy ");

    let snap = h
        .manager
        .synchronize_domain(&key, true)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::InSync))
    );
    assert_eq!(h.fleet.count("deploy "), deploys);
}

#[tokio::test]
async fn versions_are_trimmed_to_the_retention_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (h, key) = deployed_domain(dir.path()).await;
    let max = h.manager.config().max_domain_versions;

    for n in 2..=u32::try_from(max).unwrap() + 2 {
        let snap = h
            .manager
            .deploy_domain(&key)
            .await
            .unwrap()
            .wait_for_end()
            .await;
        assert_eq!(snap.result, Some(TaskOutput::Deployed { version: n }));
    }

    let numbers: Vec<u32> = h
        .manager
        .domain(&key)
        .unwrap()
        .state()
        .versions
        .iter()
        .map(|v| v.number)
        .collect();
    assert_eq!(numbers.len(), max);
    assert_eq!(numbers.first().copied(), Some(3));
}

#[tokio::test]
async fn present_domains_are_quiesced_around_the_deploy() {
    let dir = tempfile::tempdir().unwrap();
    let (h, key) = deployed_domain(dir.path()).await;
    h.fleet.with_device(HOST, |d| {
        d.quiesce_script.extend([
            fleetsync_api::QuiesceState::Quiescing,
            fleetsync_api::QuiesceState::Quiesced,
        ]);
    });

    let snap = h
        .manager
        .deploy_domain(&key)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(snap.result, Some(TaskOutput::Deployed { version: 2 }));

    let calls = h.fleet.calls();
    let position = |prefix: &str| calls.iter().rposition(|c| c.starts_with(prefix)).unwrap();
    assert!(position("quiesce ") < position("deploy "));
    assert!(position("deploy ") < position("unquiesce "));
    assert_eq!(h.fleet.count("status "), 2);
}

#[tokio::test]
async fn failed_deploy_still_unquiesces() {
    let dir = tempfile::tempdir().unwrap();
    let (h, key) = deployed_domain(dir.path()).await;
    h.fleet.with_device(HOST, |d| d.fail_deploys = true);
    let unquiesces = h.fleet.count("unquiesce ");

    let snap = h
        .manager
        .deploy_domain(&key)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert!(snap.error.is_some());

    let calls = h.fleet.calls();
    let position = |prefix: &str| calls.iter().rposition(|c| c.starts_with(prefix)).unwrap();
    assert!(position("deploy ") < position("unquiesce "));
    assert_eq!(h.fleet.count("unquiesce "), unquiesces + 1);
    assert_eq!(h.manager.domain(&key).unwrap().state().versions.len(), 1);
}

// ── Failure handling ────────────────────────────────────────────────

#[tokio::test]
async fn retries_are_exhausted_then_domain_goes_manual() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    h.manager.start().await.unwrap();
    h.add_device(HOST, SERIAL).await;
    h.fleet.with_device(HOST, |d| d.fail_deploys = true);

    let key = DomainKey::new(SERIAL, "billing");
    h.manager.create_domain(SERIAL, "billing").await.unwrap();
    let url = source_file(dir.path(), "billing.xml", "<billing/>");
    h.manager
        .set_source_configuration(&key, ConfigSource::parse(&url).unwrap())
        .await
        .unwrap();

    let first = h
        .manager
        .set_synchronization_mode(&key, SyncMode::Auto)
        .await
        .unwrap()
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(first.error.unwrap().kind(), ErrorKind::Transient);

    let second = h
        .manager
        .synchronize_domain(&key, false)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(second.error.unwrap().kind(), ErrorKind::Transient);
    assert_eq!(h.manager.domain(&key).unwrap().state().retry_count, 2);

    let third = h
        .manager
        .synchronize_domain(&key, false)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(third.error.unwrap().kind(), ErrorKind::RetryExhausted);

    let state = h.manager.domain(&key).unwrap().state();
    assert_eq!(state.mode, SyncMode::Manual);
    assert!(state.synch_failed);
    assert_eq!(state.retry_count, 3);

    let fourth = h
        .manager
        .synchronize_domain(&key, false)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        fourth.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Skipped(
            SkipReason::ManualMode
        )))
    );
    assert_eq!(h.fleet.count("deploy "), 3);
}

#[tokio::test]
async fn success_after_failures_resets_the_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    h.manager.start().await.unwrap();
    h.add_device(HOST, SERIAL).await;
    h.fleet.with_device(HOST, |d| d.fail_deploys = true);

    let key = DomainKey::new(SERIAL, "billing");
    h.manager.create_domain(SERIAL, "billing").await.unwrap();
    let url = source_file(dir.path(), "billing.xml", "<billing/>");
    h.manager
        .set_source_configuration(&key, ConfigSource::parse(&url).unwrap())
        .await
        .unwrap();
    h.manager
        .set_synchronization_mode(&key, SyncMode::Auto)
        .await
        .unwrap()
        .unwrap()
        .wait_for_end()
        .await;
    h.manager
        .synchronize_domain(&key, false)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(h.manager.domain(&key).unwrap().state().retry_count, 2);

    h.fleet.with_device(HOST, |d| d.fail_deploys = false);
    let snap = h
        .manager
        .synchronize_domain(&key, false)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Deployed { version: 1 }))
    );

    let state = h.manager.domain(&key).unwrap().state();
    assert_eq!(state.retry_count, 0);
    assert_eq!(state.mode, SyncMode::Auto);
    assert!(!state.synch_failed);
    let Some(Record::Domain(stored)) = h.repo.get(&RecordKey::Domain(key.clone())) else {
        panic!("domain record missing");
    };
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn automatic_domain_without_source_is_skipped() {
    let h = Harness::new();
    h.manager.start().await.unwrap();
    h.add_device(HOST, SERIAL).await;
    let key = DomainKey::new(SERIAL, "billing");
    h.manager.create_domain(SERIAL, "billing").await.unwrap();

    let snap = h
        .manager
        .set_synchronization_mode(&key, SyncMode::Auto)
        .await
        .unwrap()
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Skipped(
            SkipReason::NoSource
        )))
    );

    for _ in 0..3 {
        h.manager
            .synchronize_domain(&key, true)
            .await
            .unwrap()
            .wait_for_end()
            .await;
    }
    let state = h.manager.domain(&key).unwrap().state();
    assert_eq!(state.mode, SyncMode::Auto);
    assert_eq!(state.retry_count, 0);
    assert!(!state.synch_failed);
    assert_eq!(h.fleet.count("deploy "), 0);
}

#[tokio::test]
async fn unstored_version_is_not_published() {
    let dir = tempfile::tempdir().unwrap();
    let (h, flaky) = Harness::with_flaky_repository();
    h.manager.start().await.unwrap();
    h.add_device(HOST, SERIAL).await;

    let key = DomainKey::new(SERIAL, "billing");
    h.manager.create_domain(SERIAL, "billing").await.unwrap();
    let url = source_file(dir.path(), "billing.xml", "<billing v=\"1\"/>");
    h.manager
        .set_source_configuration(&key, ConfigSource::parse(&url).unwrap())
        .await
        .unwrap();
    let snap = h
        .manager
        .set_synchronization_mode(&key, SyncMode::Auto)
        .await
        .unwrap()
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Deployed { version: 1 }))
    );

    flaky.set_fail_versions(true);
    let url = source_file(dir.path(), "billing-v2.xml", "<billing v=\"2\"/>");
    let snap = h
        .manager
        .set_source_configuration(&key, ConfigSource::parse(&url).unwrap())
        .await
        .unwrap()
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(snap.error.unwrap().kind(), ErrorKind::Internal);

    let state = h.manager.domain(&key).unwrap().state();
    assert_eq!(
        state.versions.iter().map(|v| v.number).collect::<Vec<_>>(),
        [1]
    );
    assert!(state.out_of_synch);
    assert!(state.synch_failed);
    assert_eq!(state.retry_count, 1);
    assert!(h.repo.contains(&RecordKey::DomainVersion(key.clone(), 1)));
    assert!(!h.repo.contains(&RecordKey::DomainVersion(key.clone(), 2)));
    let Some(Record::Domain(stored)) = h.repo.get(&RecordKey::Domain(key.clone())) else {
        panic!("domain record missing");
    };
    assert_eq!(stored.retry_count, 1);
    assert!(stored.out_of_synch);

    flaky.set_fail_versions(false);
    let snap = h
        .manager
        .synchronize_domain(&key, false)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Deployed { version: 2 }))
    );
    assert!(h.repo.contains(&RecordKey::DomainVersion(key, 2)));
}

#[tokio::test]
async fn busy_device_defers_and_next_pass_deploys() {
    let dir = tempfile::tempdir().unwrap();
    let (h, key) = deployed_domain(dir.path()).await;
    h.fleet.with_device(HOST, |d| {
        d.running
            .insert("billing".into(), Bytes::from_static(b"<edited/>"));
    });

    let device = h.manager.device(SERIAL).unwrap();
    let guard = device.lock().lock_no_wait().unwrap();
    let snap = h
        .manager
        .synchronize_domain(&key, true)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Deferred))
    );
    assert!(h.manager.domain(&key).unwrap().state().synch_failed);
    drop(guard);

    let snap = h
        .manager
        .synchronize_domain(&key, false)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Deployed { version: 2 }))
    );
    assert!(!h.manager.domain(&key).unwrap().state().synch_failed);
}

#[tokio::test]
async fn foreground_changes_fail_fast_on_a_busy_device() {
    let dir = tempfile::tempdir().unwrap();
    let (h, key) = deployed_domain(dir.path()).await;

    let device = h.manager.device(SERIAL).unwrap();
    let _guard = device.lock().lock_no_wait().unwrap();
    let err = h
        .manager
        .set_synchronization_mode(&key, SyncMode::Manual)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
}

// ── Sources and diffs ───────────────────────────────────────────────

#[tokio::test]
async fn a_domain_cannot_source_itself() {
    let dir = tempfile::tempdir().unwrap();
    let (h, key) = deployed_domain(dir.path()).await;

    let err = h
        .manager
        .set_source_configuration(&key, ConfigSource::from_device(SERIAL, "billing").unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);

    let err = h
        .manager
        .set_source_configuration(
            &key,
            ConfigSource::Version {
                domain: key.clone(),
                number: 42,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn diff_between_version_and_device() {
    let dir = tempfile::tempdir().unwrap();
    let (h, key) = deployed_domain(dir.path()).await;

    let same = h
        .manager
        .get_diff(&key, DiffSide::Version(1), DiffSide::Device)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    let Some(TaskOutput::Diff(report)) = same.result else {
        panic!("expected a diff, got {same:?}");
    };
    assert!(report.is_identical());

    h.fleet.with_device(HOST, |d| {
        d.running
            .insert("billing".into(), Bytes::from_static(b"<edited/>"));
    });
    let changed = h
        .manager
        .get_diff(&key, DiffSide::Version(1), DiffSide::Device)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    let Some(TaskOutput::Diff(report)) = changed.result else {
        panic!("expected a diff, got {changed:?}");
    };
    assert_eq!(report.entries.len(), 1);
}

#[tokio::test]
async fn http_sources_are_fetched() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/configs/billing.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<billing remote=\"yes\"/>"))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/configs/billing.xml"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = Harness::new();
    h.manager.start().await.unwrap();
    h.add_device(HOST, SERIAL).await;
    let key = DomainKey::new(SERIAL, "billing");
    h.manager.create_domain(SERIAL, "billing").await.unwrap();
    let url = format!("{}/configs/billing.xml", server.uri());
    h.manager
        .set_source_configuration(&key, ConfigSource::parse(&url).unwrap())
        .await
        .unwrap();

    let snap = h
        .manager
        .deploy_domain(&key)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(snap.result, Some(TaskOutput::Deployed { version: 1 }));
    let running = h
        .fleet
        .with_device(HOST, |d| d.running.get("billing").cloned());
    assert_eq!(
        running,
        Some(Bytes::from_static(b"<billing remote=\"yes\"/>"))
    );
}

// ── Deployment policies ─────────────────────────────────────────────

fn policy(dir: &std::path::Path, name: &str) -> DeploymentPolicy {
    let url = source_file(dir, "policy.xml", "<policy/>");
    DeploymentPolicy {
        source: url::Url::parse(&url).unwrap(),
        domain: "policies".into(),
        policy_name: name.into(),
    }
}

#[tokio::test]
async fn version_source_requires_a_matching_policy() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    h.manager.start().await.unwrap();
    h.add_device(HOST, SERIAL).await;
    h.add_device("10.0.0.2", "B2").await;

    let origin = DomainKey::new(SERIAL, "billing");
    h.manager.create_domain(SERIAL, "billing").await.unwrap();
    let queued = h
        .manager
        .set_deployment_policy(&origin, Some(policy(dir.path(), "p1")))
        .await
        .unwrap();
    assert!(queued.is_none());
    let url = source_file(dir.path(), "billing.xml", "<billing/>");
    h.manager
        .set_source_configuration(&origin, ConfigSource::parse(&url).unwrap())
        .await
        .unwrap();
    let snap = h
        .manager
        .set_synchronization_mode(&origin, SyncMode::Auto)
        .await
        .unwrap()
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Deployed { version: 1 }))
    );
    let origin_state = h.manager.domain(&origin).unwrap().state();
    let v1 = origin_state.version(1).unwrap();
    assert_eq!(v1.policy.as_ref().unwrap().policy_name, "p1");
    assert_eq!(v1.policy.as_ref().unwrap().timestamp, v1.timestamp);

    let replica = DomainKey::new("B2", "billing");
    h.manager.create_domain("B2", "billing").await.unwrap();
    h.manager
        .set_deployment_policy(&replica, Some(policy(dir.path(), "p2")))
        .await
        .unwrap();
    h.manager
        .set_source_configuration(
            &replica,
            ConfigSource::Version {
                domain: origin.clone(),
                number: 1,
            },
        )
        .await
        .unwrap();
    let snap = h
        .manager
        .set_synchronization_mode(&replica, SyncMode::Auto)
        .await
        .unwrap()
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(snap.error.unwrap().kind(), ErrorKind::PolicyMismatch);

    for _ in 0..3 {
        let snap = h
            .manager
            .synchronize_domain(&replica, false)
            .await
            .unwrap()
            .wait_for_end()
            .await;
        assert_eq!(snap.error.unwrap().kind(), ErrorKind::PolicyMismatch);
    }
    let state = h.manager.domain(&replica).unwrap().state();
    assert_eq!(state.mode, SyncMode::Auto);
    assert_eq!(state.retry_count, 0);
    assert!(!state.synch_failed);
    assert!(state.versions.is_empty());
    assert_eq!(h.fleet.count("deploy 10.0.0.2"), 0);

    let snap = h
        .manager
        .set_deployment_policy(&replica, Some(policy(dir.path(), "p1")))
        .await
        .unwrap()
        .unwrap()
        .wait_for_end()
        .await;
    assert_eq!(
        snap.result,
        Some(TaskOutput::Synchronized(SyncOutcome::Deployed { version: 1 }))
    );
    let state = h.manager.domain(&replica).unwrap().state();
    let deployed = state.version(1).unwrap();
    assert_eq!(deployed.blob, Bytes::from_static(b"<billing/>"));
    assert_eq!(deployed.policy.as_ref().unwrap().policy_name, "p1");
}
