#![allow(clippy::unwrap_used, dead_code)]
// Shared fixtures for fleetsync-core integration tests: an in-process
// device fleet behind `DeviceCommandClient`, and a manager wired to it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use uuid::Uuid;

use fleetsync_api::{
    DeviceCommandClient, DeviceContext, DeviceMetaInfo, DiffChange, DiffEntry, DiffReport,
    DomainStatus, Error, OperationalState, PolicyPayload, QuiesceState, SubscriptionRequest,
    SubscriptionState,
};
use fleetsync_core::{
    CoreError, InMemoryRepository, Manager, ManagerConfig, Record, RecordKey, Repository,
    SaveMode,
};

// ── Fake device ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub meta: DeviceMetaInfo,
    /// Running configuration per domain. Keys are the domains present.
    pub running: BTreeMap<String, Bytes>,
    pub reachable: bool,
    pub fail_deploys: bool,
    /// Quiesce states reported in order; `Quiesced` once exhausted.
    pub quiesce_script: VecDeque<QuiesceState>,
    pub subscriptions: BTreeSet<Uuid>,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Self {
        let mut running = BTreeMap::new();
        running.insert("default".to_owned(), Bytes::from_static(b"<default/>"));
        Self {
            meta: DeviceMetaInfo {
                serial: serial.to_owned(),
                device_type: "9235".into(),
                model_type: "XI52".into(),
                firmware_level: "3.8.1".into(),
                hostname: Some(format!("{serial}.lab")),
                strict_features: BTreeSet::new(),
                non_strict_features: BTreeSet::new(),
            },
            running,
            reachable: true,
            fail_deploys: false,
            quiesce_script: VecDeque::new(),
            subscriptions: BTreeSet::new(),
        }
    }
}

// ── Fake fleet ──────────────────────────────────────────────────────

/// Devices keyed by host. Every remote call is logged as
/// `"<operation> <host>[ <domain>]"`.
#[derive(Debug, Default)]
pub struct FakeFleet {
    devices: Mutex<BTreeMap<String, FakeDevice>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, host: &str, device: FakeDevice) {
        self.devices.lock().unwrap().insert(host.to_owned(), device);
    }

    pub fn with_device<R>(&self, host: &str, f: impl FnOnce(&mut FakeDevice) -> R) -> R {
        let mut devices = self.devices.lock().unwrap();
        f(devices.get_mut(host).unwrap())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn call<R>(
        &self,
        ctx: &DeviceContext,
        label: String,
        f: impl FnOnce(&mut FakeDevice) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.calls.lock().unwrap().push(label);
        let mut devices = self.devices.lock().unwrap();
        let unreachable = || Error::Transport {
            host: ctx.host.clone(),
            reason: "connection refused".into(),
        };
        let device = devices.get_mut(&ctx.host).ok_or_else(unreachable)?;
        if !device.reachable {
            return Err(unreachable());
        }
        f(device)
    }
}

#[async_trait]
impl DeviceCommandClient for FakeFleet {
    async fn get_device_meta_info(&self, ctx: &DeviceContext) -> Result<DeviceMetaInfo, Error> {
        self.call(ctx, format!("meta {}", ctx.host), |d| Ok(d.meta.clone()))
    }

    async fn ping_device(&self, ctx: &DeviceContext) -> Result<(), Error> {
        self.call(ctx, format!("ping {}", ctx.host), |_| Ok(()))
    }

    async fn get_domain_presence(&self, ctx: &DeviceContext) -> Result<Vec<String>, Error> {
        self.call(ctx, format!("presence {}", ctx.host), |d| {
            Ok(d.running.keys().cloned().collect())
        })
    }

    async fn get_domain_status(
        &self,
        ctx: &DeviceContext,
        domain: &str,
    ) -> Result<DomainStatus, Error> {
        self.call(ctx, format!("status {} {domain}", ctx.host), |d| {
            Ok(DomainStatus {
                operational: OperationalState::Up,
                quiesce: d.quiesce_script.pop_front().unwrap_or(QuiesceState::Quiesced),
                unsaved_changes: false,
            })
        })
    }

    async fn quiesce_domain(
        &self,
        ctx: &DeviceContext,
        domain: &str,
        _timeout: Duration,
    ) -> Result<(), Error> {
        self.call(ctx, format!("quiesce {} {domain}", ctx.host), |_| Ok(()))
    }

    async fn unquiesce_domain(&self, ctx: &DeviceContext, domain: &str) -> Result<(), Error> {
        self.call(ctx, format!("unquiesce {} {domain}", ctx.host), |_| Ok(()))
    }

    async fn deploy_domain(
        &self,
        ctx: &DeviceContext,
        domain: &str,
        config: Bytes,
        _policy: Option<PolicyPayload>,
    ) -> Result<(), Error> {
        self.call(ctx, format!("deploy {} {domain}", ctx.host), |d| {
            if d.fail_deploys {
                return Err(Error::RemoteExecution {
                    operation: "deploy".into(),
                    message: "configuration rejected".into(),
                });
            }
            d.running.insert(domain.to_owned(), config);
            Ok(())
        })
    }

    async fn export_domain(&self, ctx: &DeviceContext, domain: &str) -> Result<Bytes, Error> {
        self.call(ctx, format!("export {} {domain}", ctx.host), |d| {
            d.running.get(domain).cloned().ok_or(Error::RemoteExecution {
                operation: "export".into(),
                message: format!("no domain {domain}"),
            })
        })
    }

    async fn delete_domain(&self, ctx: &DeviceContext, domain: &str) -> Result<(), Error> {
        self.call(ctx, format!("delete {} {domain}", ctx.host), |d| {
            d.running.remove(domain);
            Ok(())
        })
    }

    async fn is_different_from(
        &self,
        ctx: &DeviceContext,
        domain: &str,
        saved: Bytes,
    ) -> Result<bool, Error> {
        self.call(ctx, format!("compare {} {domain}", ctx.host), |d| {
            Ok(d.running.get(domain) != Some(&saved))
        })
    }

    async fn get_diff(
        &self,
        ctx: &DeviceContext,
        from: Bytes,
        to: Bytes,
    ) -> Result<DiffReport, Error> {
        self.call(ctx, format!("diff {}", ctx.host), |_| {
            let entries = if from == to {
                Vec::new()
            } else {
                vec![DiffEntry {
                    path: "config".into(),
                    change: DiffChange::Modified,
                }]
            };
            Ok(DiffReport { entries })
        })
    }

    async fn subscribe(
        &self,
        ctx: &DeviceContext,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionState, Error> {
        self.call(ctx, format!("subscribe {}", ctx.host), |d| {
            d.subscriptions.insert(request.id);
            Ok(SubscriptionState::Active)
        })
    }

    async fn unsubscribe(&self, ctx: &DeviceContext, id: Uuid) -> Result<(), Error> {
        self.call(ctx, format!("unsubscribe {}", ctx.host), |d| {
            d.subscriptions.remove(&id);
            Ok(())
        })
    }

    async fn deploy_firmware(
        &self,
        ctx: &DeviceContext,
        image: Bytes,
        _accept_license: bool,
    ) -> Result<(), Error> {
        self.call(ctx, format!("firmware {}", ctx.host), |d| {
            d.meta.firmware_level = String::from_utf8_lossy(&image).into_owned();
            Ok(())
        })
    }
}

// ── Failing repository ──────────────────────────────────────────────

/// Delegates to an in-memory repository, refusing new domain versions
/// while `fail_versions` is set.
#[derive(Debug)]
pub struct FlakyRepository {
    inner: Arc<InMemoryRepository>,
    pub fail_versions: AtomicBool,
}

impl FlakyRepository {
    pub fn set_fail_versions(&self, fail: bool) {
        self.fail_versions.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn create(&self, record: Record) -> Result<(), CoreError> {
        if matches!(record, Record::DomainVersion(_)) && self.fail_versions.load(Ordering::SeqCst)
        {
            return Err(CoreError::Persistence {
                message: "disk full".into(),
            });
        }
        self.inner.create(record).await
    }

    async fn update(&self, record: Record) -> Result<(), CoreError> {
        self.inner.update(record).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), CoreError> {
        self.inner.delete(key).await
    }

    async fn save(&self, mode: SaveMode) -> Result<bool, CoreError> {
        self.inner.save(mode).await
    }

    async fn load_all(&self) -> Result<Vec<Record>, CoreError> {
        self.inner.load_all().await
    }
}

// ── Manager fixtures ────────────────────────────────────────────────

/// Short waits, no timers.
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        reorder_window: Duration::from_millis(200),
        heartbeat_interval: Duration::ZERO,
        domain_sync_interval: Duration::ZERO,
        quiesce_poll_interval: Duration::from_millis(20),
        firmware_poll_interval: Duration::from_millis(20),
        firmware_deploy_timeout: Duration::from_secs(5),
        ..ManagerConfig::default()
    }
}

pub struct Harness {
    pub fleet: Arc<FakeFleet>,
    pub repo: Arc<InMemoryRepository>,
    pub manager: Manager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let fleet = FakeFleet::new();
        let repo = Arc::new(InMemoryRepository::new());
        let manager = Manager::new(config, fleet.clone(), repo.clone()).unwrap();
        Self {
            fleet,
            repo,
            manager,
        }
    }

    /// Manager backed by a [`FlakyRepository`]; `repo` still sees every
    /// record that was written.
    pub fn with_flaky_repository() -> (Self, Arc<FlakyRepository>) {
        let fleet = FakeFleet::new();
        let repo = Arc::new(InMemoryRepository::new());
        let flaky = Arc::new(FlakyRepository {
            inner: repo.clone(),
            fail_versions: AtomicBool::new(false),
        });
        let manager = Manager::new(test_config(), fleet.clone(), flaky.clone()).unwrap();
        (
            Self {
                fleet,
                repo,
                manager,
            },
            flaky,
        )
    }

    /// Put a fake device at `host` and register it with the manager.
    pub async fn add_device(&self, host: &str, serial: &str) {
        self.fleet.add(host, FakeDevice::new(serial));
        self.manager.create_device(context(host)).await.unwrap();
    }
}

pub fn context(host: &str) -> DeviceContext {
    DeviceContext::new(host, 5550, "admin", SecretString::from("admin".to_string()))
}

/// Write `body` to a fresh file and return its `file://` URL.
pub fn source_file(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    url::Url::from_file_path(&path).unwrap().to_string()
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
