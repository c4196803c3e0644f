#![allow(clippy::unwrap_used)]
// Device notifications: save events, sequence gaps and propagation to
// domains sourced from another device.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use fleetsync_api::{Notification, NotificationKind};
use fleetsync_core::{ConfigSource, DomainKey, ErrorKind, SyncMode, TaskOutput};

use common::{Harness, eventually, source_file};

const ORIGIN_HOST: &str = "10.0.0.1";
const REPLICA_HOST: &str = "10.0.0.2";

/// Two subscribed devices in one managed set. The origin carries a
/// `billing` domain; the replica manages a `billing` domain sourced from
/// it and has deployed it once.
async fn replicated_fleet() -> (Harness, DomainKey) {
    let h = Harness::new();
    h.manager.start().await.unwrap();
    h.manager.create_managed_set("prod").await.unwrap();
    for (host, serial) in [(ORIGIN_HOST, "A1"), (REPLICA_HOST, "B2")] {
        h.add_device(host, serial).await;
        h.manager
            .add_device_to_managed_set(serial, "prod")
            .await
            .unwrap();
        let device = h.manager.device(serial).unwrap();
        eventually("subscription", || async {
            device.state().subscription.is_some()
        })
        .await;
    }
    h.fleet.with_device(ORIGIN_HOST, |d| {
        d.running
            .insert("billing".into(), Bytes::from_static(b"<billing v=\"1\"/>"));
    });

    let replica = DomainKey::new("B2", "billing");
    h.manager.create_domain("B2", "billing").await.unwrap();
    h.manager
        .set_source_configuration(&replica, ConfigSource::from_device("A1", "billing").unwrap())
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
    assert!(snap.error.is_none(), "initial replica deploy failed: {snap:?}");
    (h, replica)
}

fn running(h: &Harness, host: &str) -> Option<Bytes> {
    h.fleet.with_device(host, |d| d.running.get("billing").cloned())
}

#[tokio::test]
async fn save_on_origin_propagates_to_dependents() {
    let (h, replica) = replicated_fleet().await;
    assert_eq!(
        running(&h, REPLICA_HOST),
        Some(Bytes::from_static(b"<billing v=\"1\"/>"))
    );

    h.fleet.with_device(ORIGIN_HOST, |d| {
        d.running
            .insert("billing".into(), Bytes::from_static(b"<billing v=\"2\"/>"));
    });
    h.manager
        .deliver_notification(Notification::new("A1", 1, NotificationKind::SaveConfig {
            domain: "billing".into(),
        }))
        .await
        .unwrap();

    let fleet = Arc::clone(&h.fleet);
    eventually("propagated deploy", || async {
        fleet.with_device(REPLICA_HOST, |d| d.running.get("billing").cloned())
            == Some(Bytes::from_static(b"<billing v=\"2\"/>"))
    })
    .await;

    let domain = h.manager.domain(&replica).unwrap();
    eventually("versions recorded", || async { domain.state().versions.len() == 2 }).await;
    assert!(!domain.state().out_of_synch);
}

#[tokio::test]
async fn sequence_gap_forces_a_compare_resync() {
    let (h, replica) = replicated_fleet().await;
    let compares = h.fleet.count("compare 10.0.0.2");

    h.manager
        .deliver_notification(Notification::new("B2", 1, NotificationKind::Test))
        .await
        .unwrap();
    // Drift on the replica, then a notification that skips sequence 2.
    h.fleet.with_device(REPLICA_HOST, |d| {
        d.running
            .insert("billing".into(), Bytes::from_static(b"<hand-edited/>"));
    });
    h.manager
        .deliver_notification(Notification::new("B2", 3, NotificationKind::Test))
        .await
        .unwrap();

    let fleet = Arc::clone(&h.fleet);
    eventually("compare after gap", || async {
        fleet.count("compare 10.0.0.2") > compares
    })
    .await;

    let domain = h.manager.domain(&replica).unwrap();
    eventually("drift repaired", || async { domain.state().versions.len() == 2 }).await;
    assert_eq!(
        running(&h, REPLICA_HOST),
        Some(Bytes::from_static(b"<billing v=\"1\"/>"))
    );
}

#[tokio::test]
async fn operational_state_change_refreshes_status() {
    let (h, replica) = replicated_fleet().await;
    let sender = h.manager.notification_sender();
    sender
        .send(Notification::new(
            "B2",
            1,
            NotificationKind::OperationalStateChange {
                domain: "billing".into(),
            },
        ))
        .await
        .unwrap();

    let fleet = Arc::clone(&h.fleet);
    eventually("status read", || async {
        fleet.count("status 10.0.0.2 billing") > 0
    })
    .await;

    let snap = h
        .manager
        .refresh_operation_status(&replica)
        .await
        .unwrap()
        .wait_for_end()
        .await;
    let Some(TaskOutput::Status(status)) = snap.result else {
        panic!("expected a status, got {snap:?}");
    };
    assert_eq!(status.operational, fleetsync_api::OperationalState::Up);
}

#[tokio::test]
async fn default_save_restores_every_missing_domain() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    h.manager.start().await.unwrap();
    h.add_device(ORIGIN_HOST, "A1").await;

    for name in ["billing", "ledger"] {
        let key = DomainKey::new("A1", name);
        h.manager.create_domain("A1", name).await.unwrap();
        let url = source_file(dir.path(), &format!("{name}.xml"), &format!("<{name}/>"));
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
        assert!(snap.error.is_none(), "initial deploy of {name} failed: {snap:?}");
    }

    // Both domains vanish; billing can no longer be fetched.
    std::fs::remove_file(dir.path().join("billing.xml")).unwrap();
    h.fleet.with_device(ORIGIN_HOST, |d| {
        d.running.remove("billing");
        d.running.remove("ledger");
    });
    h.manager
        .deliver_notification(Notification::new("A1", 1, NotificationKind::SaveSettings))
        .await
        .unwrap();

    let fleet = Arc::clone(&h.fleet);
    eventually("ledger restored", || async {
        fleet.with_device(ORIGIN_HOST, |d| d.running.contains_key("ledger"))
    })
    .await;
    let billing = h.manager.domain(&DomainKey::new("A1", "billing")).unwrap();
    assert!(billing.state().synch_failed);
    assert!(!h.fleet.with_device(ORIGIN_HOST, |d| d.running.contains_key("billing")));
}

#[tokio::test]
async fn notifications_from_unknown_devices_are_rejected() {
    let h = Harness::new();
    let err = h
        .manager
        .deliver_notification(Notification::new("nobody", 1, NotificationKind::Test))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
