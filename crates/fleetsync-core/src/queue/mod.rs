// ── Work dispatch ──
//
// All work areas share one monitor: a mutex over every queue plus the
// wake-up signal the processor sleeps on. Producers (callers, timers, the
// notification pump) only enqueue; the single processor task dequeues and
// executes one item at a time.

mod processor;
pub mod reorder;
mod work_area;

use std::collections::VecDeque;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;

use fleetsync_api::Notification;

pub use processor::ProcessorState;
pub(crate) use processor::{drain_for_shutdown, run_processor};
pub use reorder::{ReorderableQueue, Released, SequencedItem, Sequencing};
pub use work_area::{WorkArea, WorkAreaId};

use crate::task::BackgroundTask;
use work_area::WorkAreaQueues;

/// One unit of work picked by the processor.
#[derive(Debug)]
pub(crate) enum Next {
    Task(WorkAreaId, BackgroundTask),
    Notification(WorkAreaId, Released<Notification>),
    /// Nothing ready. `buffered` means notifications are held back by a
    /// sequence gap and will become ready without a new enqueue.
    Idle { buffered: bool },
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct DispatchState {
    pub(crate) areas: IndexMap<WorkAreaId, WorkAreaQueues>,
    /// Round-robin position: `2 * area_index + queue`, task queue = 0.
    cursor: usize,
    pub(crate) capacity: usize,
    pub(crate) window: Duration,
    pub(crate) shutdown_requested: bool,
    /// Privileged tasks queued by shutdown itself.
    shutdown_tasks: VecDeque<BackgroundTask>,
}

impl DispatchState {
    fn new(capacity: usize, window: Duration) -> Self {
        Self {
            areas: IndexMap::new(),
            cursor: 0,
            capacity,
            window,
            shutdown_requested: false,
            shutdown_tasks: VecDeque::new(),
        }
    }

    pub(crate) fn area_mut(&mut self, id: &WorkAreaId, window: Duration) -> &mut WorkAreaQueues {
        self.areas
            .entry(id.clone())
            .or_insert_with(|| WorkAreaQueues::new(window))
    }

    /// Pick the next ready item, visiting each area's task queue, then its
    /// notification queue, then the next area.
    fn next(&mut self, now: Instant) -> Next {
        if self.shutdown_requested {
            return Next::Shutdown;
        }
        let slots = self.areas.len() * 2;
        for offset in 0..slots {
            let slot = (self.cursor + offset) % slots;
            let Some((id, queues)) = self.areas.get_index_mut(slot / 2) else {
                continue;
            };
            let picked = if slot % 2 == 0 {
                queues.pop_task().map(|t| Next::Task(id.clone(), t))
            } else {
                queues
                    .pop_notification(now)
                    .map(|n| Next::Notification(id.clone(), n))
            };
            if let Some(next) = picked {
                self.cursor = (slot + 1) % slots;
                return next;
            }
        }
        Next::Idle {
            buffered: self.areas.values().any(|q| q.notifications.has_hidden(now)),
        }
    }

    /// Remove an area, handing back whatever tasks were still queued.
    fn retire(&mut self, id: &WorkAreaId) -> Vec<BackgroundTask> {
        self.cursor = 0;
        self.areas
            .shift_remove(id)
            .map(|q| q.tasks.into_iter().collect())
            .unwrap_or_default()
    }

    /// Empty every queue for shutdown. Notifications are dropped.
    fn drain(&mut self) -> (Vec<BackgroundTask>, usize) {
        let mut tasks = Vec::new();
        let mut dropped_notifications = 0;
        for (_, mut queues) in self.areas.drain(..) {
            tasks.extend(queues.tasks.drain(..));
            dropped_notifications += queues.notifications.drain().len();
        }
        tasks.extend(self.shutdown_tasks.drain(..));
        self.cursor = 0;
        (tasks, dropped_notifications)
    }
}

/// Shared dispatcher state: queues, wake-up signal and processor lifecycle.
#[derive(Debug)]
pub struct DispatchMonitor {
    pub(crate) state: Mutex<DispatchState>,
    wakeup: Notify,
    processor_state: watch::Sender<ProcessorState>,
}

impl DispatchMonitor {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let (processor_state, _) = watch::channel(ProcessorState::Stopped);
        Self {
            state: Mutex::new(DispatchState::new(capacity, window)),
            wakeup: Notify::new(),
            processor_state,
        }
    }

    pub fn processor_state(&self) -> watch::Receiver<ProcessorState> {
        self.processor_state.subscribe()
    }

    pub(crate) fn set_processor_state(&self, state: ProcessorState) {
        self.processor_state.send_replace(state);
    }

    pub(crate) fn wake(&self) {
        self.wakeup.notify_one();
    }

    pub(crate) async fn next(&self) -> Next {
        self.state.lock().await.next(Instant::now())
    }

    /// Flag shutdown and queue the final privileged task. Returns `true`
    /// if a running processor will pick it up.
    pub(crate) async fn request_shutdown(&self, task: BackgroundTask) -> bool {
        {
            let mut state = self.state.lock().await;
            state.shutdown_requested = true;
            state.shutdown_tasks.push_back(task);
        }
        self.wake();
        *self.processor_state.borrow() == ProcessorState::Running
    }

    pub(crate) async fn retire_area(&self, id: &WorkAreaId) -> Vec<BackgroundTask> {
        self.state.lock().await.retire(id)
    }

    pub(crate) async fn drain(&self) -> (Vec<BackgroundTask>, usize) {
        self.state.lock().await.drain()
    }

    pub(crate) async fn window(&self) -> Duration {
        self.state.lock().await.window
    }

    pub async fn area_ids(&self) -> Vec<WorkAreaId> {
        self.state.lock().await.areas.keys().cloned().collect()
    }

    /// Total queued tasks across all work areas.
    pub async fn pending_tasks(&self) -> usize {
        let state = self.state.lock().await;
        state.areas.values().map(|q| q.tasks.len()).sum::<usize>() + state.shutdown_tasks.len()
    }

    /// `true` if no task or notification is queued anywhere.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.areas.values().all(WorkAreaQueues::is_idle) && state.shutdown_tasks.is_empty()
    }
}
