// ── WorkArea ──
//
// A device or managed set as seen by the dispatcher: one bounded FIFO of
// background tasks plus one reordering buffer of notifications. The queues
// live inside the dispatch monitor; `WorkArea` is only an addressing handle.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use fleetsync_api::Notification;

use super::DispatchMonitor;
use super::reorder::{ReorderableQueue, Released};
use crate::error::CoreError;
use crate::progress::ProgressContainer;
use crate::task::BackgroundTask;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkAreaId {
    Device(String),
    ManagedSet(String),
}

impl fmt::Display for WorkAreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(serial) => write!(f, "device {serial}"),
            Self::ManagedSet(name) => write!(f, "managed set {name}"),
        }
    }
}

// ── Queues (owned by the monitor) ────────────────────────────────────

#[derive(Debug)]
pub(crate) struct WorkAreaQueues {
    pub(crate) tasks: VecDeque<BackgroundTask>,
    pub(crate) notifications: ReorderableQueue<Notification>,
}

impl WorkAreaQueues {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            tasks: VecDeque::new(),
            notifications: ReorderableQueue::new(window),
        }
    }

    /// Bounded enqueue. Privileged tasks are not counted against the bound.
    fn push_task(
        &mut self,
        id: &WorkAreaId,
        task: BackgroundTask,
        capacity: usize,
    ) -> Result<(), (BackgroundTask, CoreError)> {
        let bounded = self.tasks.iter().filter(|t| !t.is_privileged()).count();
        if bounded >= capacity {
            return Err((
                task,
                CoreError::QueueFull {
                    work_area: id.to_string(),
                    capacity,
                },
            ));
        }
        self.tasks.push_back(task);
        Ok(())
    }

    fn has_pending_key(&self, key: &str) -> bool {
        self.tasks
            .iter()
            .any(|t| t.coalescing_key() == Some(key))
    }

    pub(crate) fn pop_task(&mut self) -> Option<BackgroundTask> {
        self.tasks.pop_front()
    }

    pub(crate) fn pop_notification(&mut self, now: Instant) -> Option<Released<Notification>> {
        self.notifications.pop_ready(now)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.notifications.is_empty()
    }
}

// ── Handle ───────────────────────────────────────────────────────────

/// Enqueue side of one work area.
#[derive(Clone)]
pub struct WorkArea {
    id: WorkAreaId,
    monitor: Arc<DispatchMonitor>,
}

impl WorkArea {
    pub(crate) fn new(id: WorkAreaId, monitor: Arc<DispatchMonitor>) -> Self {
        Self { id, monitor }
    }

    pub fn id(&self) -> &WorkAreaId {
        &self.id
    }

    /// Append a task. Fails with `QueueFull` when the bound is reached; the
    /// task's progress then carries the same error.
    pub async fn enqueue(&self, task: BackgroundTask) -> Result<ProgressContainer, CoreError> {
        let progress = task.progress().clone();
        self.push_bounded(task, false).await?;
        Ok(progress)
    }

    /// Append a mandatory task, ignoring the queue bound.
    pub async fn enqueue_privileged(&self, task: BackgroundTask) -> ProgressContainer {
        let progress = task.progress().clone();
        {
            let mut state = self.monitor.state.lock().await;
            if state.shutdown_requested {
                task.discard();
                return progress;
            }
            let window = state.window;
            state.area_mut(&self.id, window).tasks.push_back(task);
        }
        trace!(work_area = %self.id, "privileged task enqueued");
        self.monitor.wake();
        progress
    }

    /// Enqueue unless a task with the same coalescing key is still pending.
    /// Returns `None` when coalesced.
    pub async fn enqueue_coalesced(
        &self,
        task: BackgroundTask,
    ) -> Result<Option<ProgressContainer>, CoreError> {
        let progress = task.progress().clone();
        let queued = self.push_bounded(task, true).await?;
        Ok(queued.then_some(progress))
    }

    async fn push_bounded(&self, task: BackgroundTask, coalesce: bool) -> Result<bool, CoreError> {
        {
            let mut state = self.monitor.state.lock().await;
            if state.shutdown_requested {
                let err = task.discard();
                return Err(err);
            }
            let capacity = state.capacity;
            let window = state.window;
            let queues = state.area_mut(&self.id, window);
            if coalesce {
                if let Some(key) = task.coalescing_key() {
                    if queues.has_pending_key(key) {
                        trace!(work_area = %self.id, key, "coalesced with pending task");
                        return Ok(false);
                    }
                }
            }
            if let Err((task, err)) = queues.push_task(&self.id, task, capacity) {
                debug!(work_area = %self.id, task = %task.describe(), "work queue full");
                task.progress().set_error(err.clone());
                return Err(err);
            }
        }
        trace!(work_area = %self.id, "task enqueued");
        self.monitor.wake();
        Ok(true)
    }

    pub async fn enqueue_notification(&self, notification: Notification) {
        {
            let mut state = self.monitor.state.lock().await;
            let window = state.window;
            state
                .area_mut(&self.id, window)
                .notifications
                .push(notification, Instant::now());
        }
        self.monitor.wake();
    }

    /// Forget buffered notifications from `serial` and restart its
    /// sequence tracking.
    pub async fn reset_notification_source(&self, serial: &str) {
        let mut state = self.monitor.state.lock().await;
        if let Some(queues) = state.areas.get_mut(&self.id) {
            queues.notifications.reset_source(serial);
        }
    }

    pub async fn pending_tasks(&self) -> usize {
        let state = self.monitor.state.lock().await;
        state.areas.get(&self.id).map_or(0, |q| q.tasks.len())
    }

    pub async fn pending_notifications(&self) -> usize {
        let state = self.monitor.state.lock().await;
        state
            .areas
            .get(&self.id)
            .map_or(0, |q| q.notifications.len())
    }
}

impl fmt::Debug for WorkArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkArea").field("id", &self.id).finish()
    }
}
