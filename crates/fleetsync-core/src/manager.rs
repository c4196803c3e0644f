// ── Manager facade ──
//
// Application context for one fleet: owns the entity registry, the
// dispatcher, the device client and the repository. Foreground operations
// validate, take the owning entity lock fail-fast, mutate, persist and
// enqueue follow-up work. Everything slow runs as a background task on the
// queue processor.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use fleetsync_api::{DeviceCommandClient, DeviceContext, Notification};

use crate::config::ManagerConfig;
use crate::error::{CoreError, ErrorKind};
use crate::model::{
    ConfigSource, DeploymentPolicy, Device, DeviceState, Domain, DomainKey, DomainState,
    DomainVersion, Firmware, FirmwareImage, FirmwareKey, FirmwareLevel, FirmwareVersion,
    ManagedSet, ManagementStatus, SyncMode,
};
use crate::persistence::{
    DeviceRecord, DomainRecord, DomainVersionRecord, FirmwareRecord, FirmwareVersionRecord,
    ManagedSetRecord, Record, RecordKey, Repository, SaveMode, TagRecord,
};
use crate::progress::{MacroProgressContainer, ProgressContainer};
use crate::queue::{
    DispatchMonitor, ProcessorState, WorkArea, WorkAreaId, drain_for_shutdown, run_processor,
};
use crate::registry::Registry;
use crate::source::SourceFetcher;
use crate::task::{BackgroundTask, DiffSide, SyncTarget, TaskKind};

const NOTIFICATION_CHANNEL_SIZE: usize = 256;

// ── Manager ──────────────────────────────────────────────────────────

/// Entry point for hosts.
///
/// Cheaply cloneable via `Arc<ManagerInner>`. Call [`start`](Self::start)
/// to spawn the queue processor, timers and notification pump, and
/// [`shutdown`](Self::shutdown) to stop them.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    client: Arc<dyn DeviceCommandClient>,
    repository: Arc<dyn Repository>,
    registry: Registry,
    monitor: Arc<DispatchMonitor>,
    fetcher: SourceFetcher,
    /// Stops timers and the notification pump.
    cancel: CancellationToken,
    /// Cuts short in-flight quiesce and firmware waits. Only fired by
    /// [`Manager::abort`]; a plain shutdown lets the running task finish.
    abort: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    notification_tx: mpsc::Sender<Notification>,
    notification_rx: Mutex<Option<mpsc::Receiver<Notification>>>,
}

impl Manager {
    /// Build a manager. Does not start anything.
    pub fn new(
        config: ManagerConfig,
        client: Arc<dyn DeviceCommandClient>,
        repository: Arc<dyn Repository>,
    ) -> Result<Self, CoreError> {
        let fetcher = SourceFetcher::new()?;
        Ok(Self::with_fetcher(config, client, repository, fetcher))
    }

    /// Like [`new`](Self::new) with a caller-supplied HTTP source fetcher.
    pub fn with_fetcher(
        config: ManagerConfig,
        client: Arc<dyn DeviceCommandClient>,
        repository: Arc<dyn Repository>,
        fetcher: SourceFetcher,
    ) -> Self {
        let monitor = Arc::new(DispatchMonitor::new(
            config.task_queue_capacity,
            config.reorder_window,
        ));
        let (notification_tx, notification_rx) = mpsc::channel(NOTIFICATION_CHANNEL_SIZE);

        Self {
            inner: Arc::new(ManagerInner {
                config,
                client,
                repository,
                registry: Registry::new(),
                monitor,
                fetcher,
                cancel: CancellationToken::new(),
                abort: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
                notification_tx,
                notification_rx: Mutex::new(Some(notification_rx)),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &Arc<dyn DeviceCommandClient> {
        &self.inner.client
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.inner.repository
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn monitor(&self) -> &Arc<DispatchMonitor> {
        &self.inner.monitor
    }

    pub(crate) fn fetcher(&self) -> &SourceFetcher {
        &self.inner.fetcher
    }

    /// Token observed by long device waits inside running tasks.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.abort.clone()
    }

    /// Work area that serializes work for `device`: its managed set's when
    /// managed, its own otherwise.
    pub fn work_area_for(&self, device: &Device) -> WorkArea {
        let id = match device.managed_set() {
            Some(set) => WorkAreaId::ManagedSet(set),
            None => WorkAreaId::Device(device.serial().to_owned()),
        };
        WorkArea::new(id, Arc::clone(&self.inner.monitor))
    }

    /// Best-effort save after staged writes.
    pub(crate) async fn save_unforced(&self) {
        match self.inner.repository.save(SaveMode::Unforced).await {
            Ok(true) => {}
            Ok(false) => trace!("save skipped, another save in progress"),
            Err(e) => warn!(error = %e, "unforced save failed"),
        }
    }

    async fn persist(&self, record: Record) -> Result<(), CoreError> {
        self.inner.repository.update(record).await
    }

    async fn enqueue(&self, device: &Device, kind: TaskKind) -> Result<ProgressContainer, CoreError> {
        self.work_area_for(device)
            .enqueue(BackgroundTask::new(kind))
            .await
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the queue processor, periodic timers and notification pump,
    /// then queue a subscription and a compare-synchronization for every
    /// known device.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::validation("manager has been shut down"));
        }
        let Some(notification_rx) = self.inner.notification_rx.lock().await.take() else {
            return Err(CoreError::validation("manager already started"));
        };

        let config = &self.inner.config;
        let cancel = self.inner.cancel.clone();
        {
            let mut handles = self.inner.task_handles.lock().await;
            self.inner
                .monitor
                .set_processor_state(ProcessorState::Running);
            handles.push(tokio::spawn(run_processor(self.clone())));
            handles.push(tokio::spawn(notification_pump(
                self.clone(),
                notification_rx,
                cancel.clone(),
            )));
            if !config.heartbeat_interval.is_zero() {
                handles.push(tokio::spawn(heartbeat_timer(
                    self.clone(),
                    config.heartbeat_interval,
                    cancel.clone(),
                )));
            }
            if !config.domain_sync_interval.is_zero() {
                handles.push(tokio::spawn(sync_timer(
                    self.clone(),
                    config.domain_sync_interval,
                    cancel,
                )));
            }
        }

        let devices = self.inner.registry.devices.values();
        for device in devices.iter() {
            self.queue_startup_work(device).await;
        }
        info!(devices = devices.len(), "manager started");
        Ok(())
    }

    async fn queue_startup_work(&self, device: &Arc<Device>) {
        let area = self.work_area_for(device);
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
                warn!(serial = %device.serial(), error = %e, "startup task not queued");
            }
        }
    }

    /// Stop producers, let the processor finish its current item, discard
    /// the rest of the queues and unsubscribe from every device.
    ///
    /// Returns the progress of the final unsubscribe-all task, already
    /// terminal when this returns.
    pub async fn shutdown(&self) -> ProgressContainer {
        info!("manager shutting down");
        self.inner.cancel.cancel();

        let task = BackgroundTask::new(TaskKind::UnsubscribeAll);
        let progress = task.progress().clone();
        let running = self.inner.monitor.request_shutdown(task).await;
        if !running {
            drain_for_shutdown(self).await;
        }

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        drop(handles);

        if let Err(e) = self.inner.repository.save(SaveMode::Forced).await {
            warn!(error = %e, "final save failed");
        }
        progress
    }

    /// Cut short device waits of the task currently running, then shut
    /// down.
    pub async fn abort(&self) -> ProgressContainer {
        self.inner.abort.cancel();
        self.shutdown().await
    }

    /// Work areas currently known to the dispatcher.
    pub async fn work_areas(&self) -> Vec<WorkAreaId> {
        self.inner.monitor.area_ids().await
    }

    pub fn processor_state(&self) -> watch::Receiver<ProcessorState> {
        self.inner.monitor.processor_state()
    }

    /// Rebuild the registry from the repository. Only valid before
    /// [`start`](Self::start). Returns the number of records loaded.
    pub async fn restore(&self) -> Result<usize, CoreError> {
        if *self.inner.monitor.processor_state().borrow() != ProcessorState::Stopped {
            return Err(CoreError::validation(
                "cannot restore while the processor is running",
            ));
        }
        let mut records = self.inner.repository.load_all().await?;
        records.sort_by_key(Record::key);
        let loaded = records.len();

        let registry = &self.inner.registry;
        let mut members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut versions: BTreeMap<DomainKey, Vec<DomainVersion>> = BTreeMap::new();
        let mut families: BTreeMap<FirmwareKey, Firmware> = BTreeMap::new();

        for record in records {
            match record {
                Record::ManagedSet(r) => {
                    registry
                        .managed_sets
                        .insert(r.name.clone(), Arc::new(ManagedSet::new(r.name)))?;
                }
                Record::Device(r) => {
                    if let Some(set) = &r.managed_set {
                        members
                            .entry(set.clone())
                            .or_default()
                            .insert(r.serial.clone());
                    }
                    let device = Device::new(r.serial.clone(), r.context(), r.state());
                    registry.devices.insert(r.serial, Arc::new(device))?;
                }
                Record::Domain(r) => {
                    let device = registry.device(&r.serial)?;
                    let domain = Domain::new(device, r.name.clone(), r.state());
                    registry
                        .domains
                        .insert(DomainKey::new(&r.serial, &r.name), Arc::new(domain))?;
                }
                Record::DomainVersion(r) => {
                    versions
                        .entry(DomainKey::new(&r.serial, &r.domain))
                        .or_default()
                        .push(r.version());
                }
                Record::Firmware(r) => {
                    families.insert(
                        r.key.clone(),
                        Firmware {
                            key: r.key,
                            versions: Vec::new(),
                        },
                    );
                }
                Record::FirmwareVersion(r) => {
                    let version = r.version()?;
                    families
                        .entry(r.key.clone())
                        .or_insert_with(|| Firmware {
                            key: r.key,
                            versions: Vec::new(),
                        })
                        .versions
                        .push(Arc::new(version));
                }
                Record::Tag(r) => {
                    let device = registry.device(&r.serial)?;
                    let guard = device.lock().lock_wait().await;
                    device.modify(&guard, |s| {
                        s.tags.insert(r.tag.clone());
                    });
                }
            }
        }

        for (name, serials) in members {
            registry.managed_set(&name)?.restore_members(serials);
        }
        for (key, mut list) in versions {
            list.sort_by_key(|v| v.number);
            registry.domain(&key)?.note(|s| s.versions.clone_from(&list));
        }
        let families = families
            .into_values()
            .map(|mut family| {
                family.versions.sort_by_key(|v| v.timestamp);
                family
            })
            .collect();
        registry.firmware.restore(families);

        info!(records = loaded, "registry restored");
        Ok(loaded)
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Contact a device, read its identity and start tracking it.
    pub async fn create_device(&self, context: DeviceContext) -> Result<Arc<Device>, CoreError> {
        let client = &self.inner.client;
        let meta = client.get_device_meta_info(&context).await?;
        if self.inner.registry.devices.contains(&meta.serial) {
            return Err(CoreError::AlreadyExists {
                entity_type: "Device".into(),
                identifier: meta.serial,
            });
        }
        let presence = client.get_domain_presence(&context).await?;

        let mut state = DeviceState::from_meta(&meta);
        state.domain_names = presence.into_iter().collect();
        let device = self.inner.registry.devices.insert(
            meta.serial.clone(),
            Arc::new(Device::new(meta.serial, context, state)),
        )?;
        self.inner
            .repository
            .create(Record::Device(DeviceRecord::from_device(&device)))
            .await?;
        self.save_unforced().await;
        info!(serial = %device.serial(), address = %device.context().address(), "device added");
        Ok(device)
    }

    /// Stop managing a device: drops its domains, tags, set membership and
    /// queued work, and unsubscribes from it.
    pub async fn remove_device(&self, serial: &str) -> Result<(), CoreError> {
        let device = self.inner.registry.device(serial)?;
        let set = match device.managed_set() {
            Some(name) => Some(self.inner.registry.managed_set(&name)?),
            None => None,
        };
        let set_guard = match &set {
            Some(set) => Some(set.lock().lock_no_wait()?),
            None => None,
        };
        let guard = device.lock().lock_no_wait()?;
        let subscribed = device.state().subscription.is_some();

        if let (Some(set), Some(set_guard)) = (&set, &set_guard) {
            set.remove_member(set_guard, serial);
        }
        self.forget_device(&device).await?;
        drop(guard);
        drop(set_guard);
        self.save_unforced().await;

        if subscribed {
            self.work_area_for(&device)
                .enqueue_privileged(BackgroundTask::new(TaskKind::Unsubscribe {
                    device: Arc::clone(&device),
                }))
                .await;
        }
        info!(serial, "device removed");
        Ok(())
    }

    /// Forced removal of a device that no longer is what it was. No
    /// unsubscribe is attempted: the hardware behind the address changed.
    pub(crate) async fn purge_device(&self, device: &Arc<Device>) {
        let set = device
            .managed_set()
            .and_then(|name| self.inner.registry.managed_set(&name).ok());
        let set_guard = match &set {
            Some(set) => Some(set.lock().lock_wait().await),
            None => None,
        };
        let guard = device.lock().lock_wait().await;
        if let (Some(set), Some(set_guard)) = (&set, &set_guard) {
            set.remove_member(set_guard, device.serial());
        }
        if let Err(e) = self.forget_device(device).await {
            warn!(serial = %device.serial(), error = %e, "device removal incomplete");
        }
        drop(guard);
        drop(set_guard);
        self.save_unforced().await;
    }

    /// Registry and repository side of device removal. Caller holds the
    /// device lock (and the set lock, if managed).
    async fn forget_device(&self, device: &Arc<Device>) -> Result<(), CoreError> {
        let registry = &self.inner.registry;
        let repo = &self.inner.repository;
        let serial = device.serial();

        for domain in registry.domains_of(serial) {
            let key = domain.key();
            registry.domains.remove(&key)?;
            for version in &domain.state().versions {
                repo.delete(&RecordKey::DomainVersion(key.clone(), version.number))
                    .await?;
            }
            repo.delete(&RecordKey::Domain(key)).await?;
        }
        for tag in &device.state().tags {
            repo.delete(&RecordKey::Tag {
                serial: serial.to_owned(),
                tag: tag.clone(),
            })
            .await?;
        }
        registry.devices.remove(&serial.to_owned())?;
        repo.delete(&RecordKey::Device(serial.to_owned())).await?;

        self.retire_area(
            WorkAreaId::Device(serial.to_owned()),
            CoreError::deleted("Device", serial),
        )
        .await;
        Ok(())
    }

    pub(crate) async fn retire_area(&self, id: WorkAreaId, reason: CoreError) {
        let abandoned = self.inner.monitor.retire_area(&id).await;
        if !abandoned.is_empty() {
            debug!(work_area = %id, tasks = abandoned.len(), "abandoning queued tasks");
        }
        for task in abandoned {
            task.abandon(reason.clone());
        }
    }

    pub fn device(&self, serial: &str) -> Result<Arc<Device>, CoreError> {
        self.inner.registry.device(serial)
    }

    pub fn devices(&self) -> Arc<Vec<Arc<Device>>> {
        self.inner.registry.devices.values()
    }

    pub async fn add_tag(&self, serial: &str, tag: &str) -> Result<(), CoreError> {
        let device = self.inner.registry.device(serial)?;
        let guard = device.lock().lock_no_wait()?;
        if device.state().tags.contains(tag) {
            return Ok(());
        }
        device.modify(&guard, |s| {
            s.tags.insert(tag.to_owned());
        });
        self.inner
            .repository
            .create(Record::Tag(TagRecord {
                serial: serial.to_owned(),
                tag: tag.to_owned(),
            }))
            .await?;
        drop(guard);
        self.save_unforced().await;
        Ok(())
    }

    pub async fn remove_tag(&self, serial: &str, tag: &str) -> Result<(), CoreError> {
        let device = self.inner.registry.device(serial)?;
        let guard = device.lock().lock_no_wait()?;
        device.modify(&guard, |s| {
            s.tags.remove(tag);
        });
        self.inner
            .repository
            .delete(&RecordKey::Tag {
                serial: serial.to_owned(),
                tag: tag.to_owned(),
            })
            .await?;
        drop(guard);
        self.save_unforced().await;
        Ok(())
    }

    /// Queue an immediate heartbeat.
    pub async fn heartbeat(&self, serial: &str) -> Result<ProgressContainer, CoreError> {
        let device = self.inner.registry.device(serial)?;
        self.enqueue(&device, TaskKind::Heartbeat {
            device: Arc::clone(&device),
        })
        .await
    }

    // ── Managed sets ─────────────────────────────────────────────────

    pub async fn create_managed_set(&self, name: &str) -> Result<Arc<ManagedSet>, CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::validation("managed set name must not be empty"));
        }
        let set = self
            .inner
            .registry
            .managed_sets
            .insert(name.to_owned(), Arc::new(ManagedSet::new(name)))?;
        self.inner
            .repository
            .create(Record::ManagedSet(ManagedSetRecord {
                name: name.to_owned(),
            }))
            .await?;
        self.save_unforced().await;
        info!(managed_set = name, "managed set created");
        Ok(set)
    }

    /// Delete an empty managed set.
    pub async fn delete_managed_set(&self, name: &str) -> Result<(), CoreError> {
        let set = self.inner.registry.managed_set(name)?;
        let guard = set.lock().lock_no_wait()?;
        if !set.is_empty() {
            return Err(CoreError::validation(format!(
                "managed set {name} still has {} member(s)",
                set.members().len()
            )));
        }
        self.inner
            .registry
            .managed_sets
            .remove(&name.to_owned())?;
        self.inner
            .repository
            .delete(&RecordKey::ManagedSet(name.to_owned()))
            .await?;
        drop(guard);
        self.retire_area(
            WorkAreaId::ManagedSet(name.to_owned()),
            CoreError::deleted("ManagedSet", name),
        )
        .await;
        self.save_unforced().await;
        info!(managed_set = name, "managed set deleted");
        Ok(())
    }

    /// Put a device under management. Work queued on the device moves to
    /// the set's work area; a subscription and a compare-synchronization
    /// follow.
    pub async fn add_device_to_managed_set(
        &self,
        serial: &str,
        set_name: &str,
    ) -> Result<(), CoreError> {
        let set = self.inner.registry.managed_set(set_name)?;
        let device = self.inner.registry.device(serial)?;
        let set_guard = set.lock().lock_no_wait()?;
        let guard = device.lock().lock_no_wait()?;
        if let Some(current) = device.managed_set() {
            return Err(CoreError::validation(format!(
                "device {serial} already belongs to managed set {current}"
            )));
        }

        set.insert_member(&set_guard, serial);
        device.modify(&guard, |s| {
            s.managed_set = Some(set_name.to_owned());
            s.device_status = ManagementStatus::Pending;
            s.firmware_status = ManagementStatus::Pending;
        });
        self.persist(Record::Device(DeviceRecord::from_device(&device)))
            .await?;
        drop(guard);
        drop(set_guard);
        self.save_unforced().await;

        let area = self.work_area_for(&device);
        let moved = self
            .inner
            .monitor
            .retire_area(&WorkAreaId::Device(serial.to_owned()))
            .await;
        for task in moved {
            area.enqueue_privileged(task).await;
        }
        self.queue_startup_work(&device).await;
        info!(serial, managed_set = set_name, "device added to managed set");
        Ok(())
    }

    /// Release a device from management. Returns the progress of the
    /// privileged unsubscribe.
    pub async fn remove_device_from_managed_set(
        &self,
        serial: &str,
    ) -> Result<ProgressContainer, CoreError> {
        let device = self.inner.registry.device(serial)?;
        let Some(set_name) = device.managed_set() else {
            return Err(CoreError::validation(format!(
                "device {serial} is not in a managed set"
            )));
        };
        let set = self.inner.registry.managed_set(&set_name)?;
        let set_guard = set.lock().lock_no_wait()?;
        let guard = device.lock().lock_no_wait()?;

        set.remove_member(&set_guard, serial);
        device.modify(&guard, |s| {
            s.managed_set = None;
            s.device_status = ManagementStatus::Unmanaged;
            s.firmware_status = ManagementStatus::Unmanaged;
        });
        self.persist(Record::Device(DeviceRecord::from_device(&device)))
            .await?;
        drop(guard);
        drop(set_guard);
        self.save_unforced().await;

        info!(serial, managed_set = %set_name, "device removed from managed set");
        Ok(self
            .work_area_for(&device)
            .enqueue_privileged(BackgroundTask::new(TaskKind::Unsubscribe { device }))
            .await)
    }

    pub fn managed_set(&self, name: &str) -> Result<Arc<ManagedSet>, CoreError> {
        self.inner.registry.managed_set(name)
    }

    pub fn managed_sets(&self) -> Arc<Vec<Arc<ManagedSet>>> {
        self.inner.registry.managed_sets.values()
    }

    /// Compare-synchronize every member of a managed set.
    pub async fn synchronize_managed_set(
        &self,
        name: &str,
    ) -> Result<MacroProgressContainer, CoreError> {
        let set = self.inner.registry.managed_set(name)?;
        let area = WorkArea::new(
            WorkAreaId::ManagedSet(name.to_owned()),
            Arc::clone(&self.inner.monitor),
        );
        let mut progress = MacroProgressContainer::new();
        for serial in set.members().iter() {
            let device = self.inner.registry.device(serial)?;
            let task = BackgroundTask::new(TaskKind::Synchronize {
                target: SyncTarget::Device(device),
                compare: true,
            });
            progress.add(serial.clone(), task.progress().clone());
            if let Err(e) = area.enqueue(task).await {
                debug!(serial = %serial, error = %e, "member synchronization not queued");
            }
        }
        Ok(progress)
    }

    // ── Domains ──────────────────────────────────────────────────────

    /// Start managing a domain of a device. New domains are in manual mode
    /// with no source.
    pub async fn create_domain(&self, serial: &str, name: &str) -> Result<Arc<Domain>, CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::validation("domain name must not be empty"));
        }
        let device = self.inner.registry.device(serial)?;
        let guard = device.lock().lock_no_wait()?;
        let state = DomainState::new(self.inner.config.default_quiesce_timeout);
        let domain = self.inner.registry.domains.insert(
            DomainKey::new(serial, name),
            Arc::new(Domain::new(Arc::clone(&device), name, state)),
        )?;
        self.inner
            .repository
            .create(Record::Domain(DomainRecord::from_domain(&domain)))
            .await?;
        drop(guard);
        self.save_unforced().await;
        info!(domain = %domain.key(), "domain created");
        Ok(domain)
    }

    /// Stop managing a domain. The domain stays on the device.
    pub async fn delete_domain(&self, key: &DomainKey) -> Result<(), CoreError> {
        let domain = self.inner.registry.domain(key)?;
        let guard = domain.device().lock().lock_no_wait()?;
        self.inner.registry.domains.remove(key)?;
        let repo = &self.inner.repository;
        for version in &domain.state().versions {
            repo.delete(&RecordKey::DomainVersion(key.clone(), version.number))
                .await?;
        }
        repo.delete(&RecordKey::Domain(key.clone())).await?;
        drop(guard);
        self.save_unforced().await;
        info!(domain = %key, "domain deleted");
        Ok(())
    }

    pub fn domain(&self, key: &DomainKey) -> Result<Arc<Domain>, CoreError> {
        self.inner.registry.domain(key)
    }

    pub fn domains(&self) -> Arc<Vec<Arc<Domain>>> {
        self.inner.registry.domains.values()
    }

    /// Point a domain at a new source. The domain becomes out of synch; in
    /// auto mode a synchronization is queued and its progress returned.
    pub async fn set_source_configuration(
        &self,
        key: &DomainKey,
        source: ConfigSource,
    ) -> Result<Option<ProgressContainer>, CoreError> {
        self.validate_source(key, &source)?;
        self.update_domain(key, move |s| {
            s.source = Some(source.clone());
            s.source_timestamp = None;
            s.out_of_synch = true;
        })
        .await
    }

    /// Attach (or with `None`, detach) a deployment policy.
    pub async fn set_deployment_policy(
        &self,
        key: &DomainKey,
        policy: Option<DeploymentPolicy>,
    ) -> Result<Option<ProgressContainer>, CoreError> {
        self.update_domain(key, move |s| {
            s.policy.clone_from(&policy);
            s.policy_timestamp = None;
            s.out_of_synch = true;
        })
        .await
    }

    fn validate_source(&self, key: &DomainKey, source: &ConfigSource) -> Result<(), CoreError> {
        match source {
            ConfigSource::Url { url } => match url.scheme() {
                "file" | "http" | "https" => Ok(()),
                _ => match source.device_reference() {
                    Some(origin) if &origin == key => Err(CoreError::validation(format!(
                        "domain {key} cannot be its own source"
                    ))),
                    Some(_) => Ok(()),
                    None => Err(CoreError::validation(format!(
                        "unsupported source URL {url}"
                    ))),
                },
            },
            ConfigSource::Version { domain, number } => {
                let origin = self.inner.registry.domain(domain)?;
                if origin.state().version(*number).is_none() {
                    return Err(CoreError::not_found(
                        "DomainVersion",
                        format!("{domain} #{number}"),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Apply a desired-state change, persist it and queue a
    /// synchronization when the domain is automatic.
    async fn update_domain(
        &self,
        key: &DomainKey,
        change: impl Fn(&mut DomainState),
    ) -> Result<Option<ProgressContainer>, CoreError> {
        let domain = self.inner.registry.domain(key)?;
        let guard = domain.device().lock().lock_no_wait()?;
        let state = domain.modify(&guard, change);
        self.persist(Record::Domain(DomainRecord::from_domain(&domain)))
            .await?;
        drop(guard);
        self.save_unforced().await;

        if state.mode != SyncMode::Auto {
            return Ok(None);
        }
        let progress = self
            .enqueue(domain.device(), TaskKind::Synchronize {
                target: SyncTarget::Domain(Arc::clone(&domain)),
                compare: false,
            })
            .await?;
        Ok(Some(progress))
    }

    /// Switch between manual and automatic synchronization. Resets the
    /// retry budget; switching to automatic queues a compare pass.
    pub async fn set_synchronization_mode(
        &self,
        key: &DomainKey,
        mode: SyncMode,
    ) -> Result<Option<ProgressContainer>, CoreError> {
        let domain = self.inner.registry.domain(key)?;
        let guard = domain.device().lock().lock_no_wait()?;
        domain.modify(&guard, |s| {
            s.mode = mode;
            s.retry_count = 0;
        });
        self.persist(Record::Domain(DomainRecord::from_domain(&domain)))
            .await?;
        drop(guard);
        self.save_unforced().await;
        info!(domain = %key, mode = %mode, "synchronization mode changed");

        if mode != SyncMode::Auto {
            return Ok(None);
        }
        let progress = self
            .enqueue(domain.device(), TaskKind::Synchronize {
                target: SyncTarget::Domain(Arc::clone(&domain)),
                compare: true,
            })
            .await?;
        Ok(Some(progress))
    }

    /// Zero means fire-and-forget quiesce.
    pub async fn set_quiesce_timeout(
        &self,
        key: &DomainKey,
        timeout: Duration,
    ) -> Result<(), CoreError> {
        let domain = self.inner.registry.domain(key)?;
        let guard = domain.device().lock().lock_no_wait()?;
        domain.modify(&guard, |s| s.quiesce_timeout = timeout);
        self.persist(Record::Domain(DomainRecord::from_domain(&domain)))
            .await?;
        drop(guard);
        self.save_unforced().await;
        Ok(())
    }

    /// Queue an unconditional deploy from the domain's source.
    pub async fn deploy_domain(&self, key: &DomainKey) -> Result<ProgressContainer, CoreError> {
        let domain = self.inner.registry.domain(key)?;
        if domain.state().source.is_none() {
            return Err(CoreError::validation(format!(
                "domain {key} has no source configuration"
            )));
        }
        self.enqueue(domain.device(), TaskKind::DeployDomain {
            domain: Arc::clone(&domain),
        })
        .await
    }

    pub async fn synchronize_domain(
        &self,
        key: &DomainKey,
        compare: bool,
    ) -> Result<ProgressContainer, CoreError> {
        let domain = self.inner.registry.domain(key)?;
        self.enqueue(domain.device(), TaskKind::Synchronize {
            target: SyncTarget::Domain(Arc::clone(&domain)),
            compare,
        })
        .await
    }

    pub async fn get_diff(
        &self,
        key: &DomainKey,
        left: DiffSide,
        right: DiffSide,
    ) -> Result<ProgressContainer, CoreError> {
        let domain = self.inner.registry.domain(key)?;
        self.enqueue(domain.device(), TaskKind::GetDiff {
            domain: Arc::clone(&domain),
            left,
            right,
        })
        .await
    }

    pub async fn refresh_operation_status(
        &self,
        key: &DomainKey,
    ) -> Result<ProgressContainer, CoreError> {
        let domain = self.inner.registry.domain(key)?;
        self.enqueue(domain.device(), TaskKind::GetOperationStatus {
            domain: Arc::clone(&domain),
        })
        .await
    }

    /// The only mutable field of a recorded version.
    pub async fn set_version_comment(
        &self,
        key: &DomainKey,
        number: u32,
        comment: &str,
    ) -> Result<(), CoreError> {
        let domain = self.inner.registry.domain(key)?;
        let guard = domain.device().lock().lock_no_wait()?;
        if domain.state().version(number).is_none() {
            return Err(CoreError::not_found(
                "DomainVersion",
                format!("{key} #{number}"),
            ));
        }
        let state = domain.modify(&guard, |s| {
            if let Some(v) = s.versions.iter_mut().find(|v| v.number == number) {
                comment.clone_into(&mut v.comment);
            }
        });
        if let Some(version) = state.version(number) {
            self.persist(Record::DomainVersion(DomainVersionRecord::from_version(
                key, version,
            )))
            .await?;
        }
        drop(guard);
        self.save_unforced().await;
        Ok(())
    }

    // ── Firmware ─────────────────────────────────────────────────────

    /// Register a firmware image, trimming the family's oldest versions
    /// past the retention limit. An image older than every retained version
    /// is rejected rather than stored and trimmed at once.
    pub async fn add_firmware_version(
        &self,
        image: FirmwareImage,
    ) -> Result<Arc<FirmwareVersion>, CoreError> {
        let store = &self.inner.registry.firmware;
        let guard = store.lock().lock_no_wait()?;
        let inserted = store.insert(
            &guard,
            FirmwareVersion::from(image),
            self.inner.config.max_firmware_versions,
        )?;

        let repo = &self.inner.repository;
        let version = &inserted.version;
        if inserted.new_family {
            repo.create(Record::Firmware(FirmwareRecord {
                key: version.key.clone(),
            }))
            .await?;
        }
        repo.create(Record::FirmwareVersion(FirmwareVersionRecord::from_version(
            version,
        )))
        .await?;
        for old in &inserted.trimmed {
            debug!(firmware = %old.key, level = %old.level, "trimming old firmware version");
            repo.delete(&RecordKey::FirmwareVersion(
                old.key.clone(),
                old.level.to_string(),
            ))
            .await?;
        }
        drop(guard);
        self.save_unforced().await;
        info!(firmware = %version.key, level = %version.level, "firmware version added");
        Ok(inserted.version)
    }

    pub async fn remove_firmware_version(
        &self,
        key: &FirmwareKey,
        level: &FirmwareLevel,
    ) -> Result<(), CoreError> {
        let store = &self.inner.registry.firmware;
        let guard = store.lock().lock_no_wait()?;
        let emptied = store.remove(&guard, key, level)?;
        let repo = &self.inner.repository;
        repo.delete(&RecordKey::FirmwareVersion(key.clone(), level.to_string()))
            .await?;
        if emptied {
            repo.delete(&RecordKey::Firmware(key.clone())).await?;
        }
        drop(guard);
        self.save_unforced().await;
        Ok(())
    }

    /// Firmware families the device can run.
    pub fn firmware_for(&self, serial: &str) -> Result<Vec<Firmware>, CoreError> {
        let device = self.inner.registry.device(serial)?;
        Ok(self.inner.registry.firmware.compatible(&device.state()))
    }

    pub fn best_firmware_version(
        &self,
        serial: &str,
    ) -> Result<Option<Arc<FirmwareVersion>>, CoreError> {
        let device = self.inner.registry.device(serial)?;
        Ok(self.inner.registry.firmware.best_for(&device.state()))
    }

    /// Queue a firmware install. The license must be accepted up front.
    pub async fn deploy_firmware(
        &self,
        serial: &str,
        version: Arc<FirmwareVersion>,
        accept_license: bool,
    ) -> Result<ProgressContainer, CoreError> {
        if !accept_license {
            return Err(CoreError::validation(
                "the firmware license must be accepted",
            ));
        }
        let device = self.inner.registry.device(serial)?;
        if !version.key.fits(&device.state()) {
            return Err(CoreError::validation(format!(
                "firmware {} for {} does not fit device {serial}",
                version.level, version.key
            )));
        }
        self.enqueue(&device, TaskKind::DeployFirmware {
            device: Arc::clone(&device),
            version,
            accept_license,
        })
        .await
    }

    /// Install the best compatible firmware on every member of a managed
    /// set. Members with no compatible firmware are skipped.
    pub async fn deploy_firmware_to_managed_set(
        &self,
        name: &str,
        accept_license: bool,
    ) -> Result<MacroProgressContainer, CoreError> {
        if !accept_license {
            return Err(CoreError::validation(
                "the firmware license must be accepted",
            ));
        }
        let set = self.inner.registry.managed_set(name)?;
        let mut progress = MacroProgressContainer::new();
        for serial in set.members().iter() {
            let Some(version) = self.best_firmware_version(serial)? else {
                debug!(serial = %serial, "no compatible firmware, skipping");
                continue;
            };
            let device = self.inner.registry.device(serial)?;
            let task = BackgroundTask::new(TaskKind::DeployFirmware {
                device: Arc::clone(&device),
                version,
                accept_license,
            });
            progress.add(serial.clone(), task.progress().clone());
            if let Err(e) = self.work_area_for(&device).enqueue(task).await {
                debug!(serial = %serial, error = %e, "firmware install not queued");
            }
        }
        Ok(progress)
    }

    // ── Notifications ────────────────────────────────────────────────

    /// Route a notification to the work area of the device that sent it.
    pub async fn deliver_notification(&self, notification: Notification) -> Result<(), CoreError> {
        let device = self.inner.registry.device(&notification.serial)?;
        trace!(serial = %notification.serial, sequence = notification.sequence, "notification received");
        self.work_area_for(&device)
            .enqueue_notification(notification)
            .await;
        Ok(())
    }

    /// Channel for transports that receive notifications on their own task.
    pub fn notification_sender(&self) -> mpsc::Sender<Notification> {
        self.inner.notification_tx.clone()
    }

    // ── Timer bodies ─────────────────────────────────────────────────

    async fn queue_heartbeats(&self) {
        for device in self.inner.registry.devices.values().iter() {
            let task = BackgroundTask::new(TaskKind::Heartbeat {
                device: Arc::clone(device),
            })
            .coalescing(format!("heartbeat:{}", device.serial()));
            self.queue_timer_task(device, task).await;
        }
    }

    async fn queue_synchronizations(&self) {
        for device in self.inner.registry.devices.values().iter() {
            if self.inner.registry.domains_of(device.serial()).is_empty() {
                continue;
            }
            let task = BackgroundTask::new(TaskKind::Synchronize {
                target: SyncTarget::Device(Arc::clone(device)),
                compare: false,
            })
            .coalescing(format!("sync:{}", device.serial()));
            self.queue_timer_task(device, task).await;
        }
    }

    async fn queue_timer_task(&self, device: &Device, task: BackgroundTask) {
        match self.work_area_for(device).enqueue_coalesced(task).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Busy => {
                debug!(serial = %device.serial(), error = %e, "timer task dropped, queue full");
            }
            Err(e) => debug!(serial = %device.serial(), error = %e, "timer task not queued"),
        }
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("devices", &self.inner.registry.devices.len())
            .field("domains", &self.inner.registry.domains.len())
            .field("processor", &*self.inner.monitor.processor_state().borrow())
            .finish_non_exhaustive()
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Periodically queue a heartbeat for every device.
async fn heartbeat_timer(manager: Manager, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => manager.queue_heartbeats().await,
        }
    }
}

/// Periodically queue a synchronization pass for every device with
/// managed domains.
async fn sync_timer(manager: Manager, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => manager.queue_synchronizations().await,
        }
    }
}

/// Move notifications from the public channel into work areas.
async fn notification_pump(
    manager: Manager,
    mut rx: mpsc::Receiver<Notification>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            notification = rx.recv() => {
                let Some(notification) = notification else { break };
                if let Err(e) = manager.deliver_notification(notification).await {
                    debug!(error = %e, "notification dropped");
                }
            }
        }
    }
}
