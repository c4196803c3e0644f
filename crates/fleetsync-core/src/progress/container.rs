// ── ProgressContainer ──
//
// Observable state of one long-running operation, backed by a `watch`
// channel so every mutation wakes waiters atomically. Terminal state
// (complete or error) is sticky: later updates are ignored.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;
use uuid::Uuid;

use super::TaskOutput;
use crate::error::CoreError;

/// Point-in-time view of a [`ProgressContainer`].
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub total_steps: u32,
    pub current_step: u32,
    pub description: String,
    pub complete: bool,
    pub result: Option<TaskOutput>,
    pub error: Option<CoreError>,
    /// Identifier tying this operation to log lines and device requests.
    pub correlator: Option<String>,
}

impl ProgressSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.complete || self.error.is_some()
    }

    fn finish(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Complete(result) => {
                self.total_steps = self.current_step;
                self.complete = true;
                self.result = result;
            }
            Outcome::Error(err) => {
                self.total_steps = self.total_steps.max(self.current_step);
                self.error = Some(err);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Complete(Option<TaskOutput>),
    Error(CoreError),
}

/// Published snapshot plus an outcome staged for [`ProgressContainer::commit`].
#[derive(Debug, Default)]
struct ProgressState {
    snapshot: ProgressSnapshot,
    staged: Option<Outcome>,
}

/// Thread-safe handle to the state of one operation.
///
/// Cheaply cloneable; every clone observes and mutates the same state.
#[derive(Clone)]
pub struct ProgressContainer {
    inner: Arc<ProgressInner>,
}

struct ProgressInner {
    id: Uuid,
    tx: watch::Sender<ProgressState>,
}

impl ProgressContainer {
    pub fn new(description: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let state = ProgressState {
            snapshot: ProgressSnapshot {
                description: description.into(),
                correlator: Some(id.to_string()),
                ..ProgressSnapshot::default()
            },
            staged: None,
        };
        let (tx, _) = watch::channel(state);
        Self {
            inner: Arc::new(ProgressInner { id, tx }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Replace the default correlator (the container id).
    pub fn set_correlator(&self, correlator: impl Into<String>) {
        let correlator = correlator.into();
        self.inner
            .tx
            .send_modify(|s| s.snapshot.correlator = Some(correlator));
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.tx.borrow().snapshot.clone()
    }

    pub fn total_steps(&self) -> u32 {
        self.inner.tx.borrow().snapshot.total_steps
    }

    pub fn current_step(&self) -> u32 {
        self.inner.tx.borrow().snapshot.current_step
    }

    pub fn description(&self) -> String {
        self.inner.tx.borrow().snapshot.description.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.tx.borrow().snapshot.complete
    }

    /// The terminal error, if the operation failed.
    pub fn error(&self) -> Option<CoreError> {
        self.inner.tx.borrow().snapshot.error.clone()
    }

    pub fn has_error(&self) -> bool {
        self.inner.tx.borrow().snapshot.error.is_some()
    }

    pub fn result(&self) -> Option<TaskOutput> {
        self.inner.tx.borrow().snapshot.result.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.tx.borrow().snapshot.is_terminal()
    }

    // ── Step accounting ──────────────────────────────────────────

    pub fn set_total_steps(&self, total: u32) {
        self.update(|s| s.total_steps = total);
    }

    pub fn increment_total_steps(&self, by: u32) {
        self.update(|s| s.total_steps = s.total_steps.saturating_add(by));
    }

    /// Advance by `by` steps and describe what is happening now. Keeps
    /// `total_steps` at least `current_step`.
    pub fn increment_current_step(&self, by: u32, description: impl Into<String>) {
        let description = description.into();
        self.update(|s| {
            s.current_step = s.current_step.saturating_add(by);
            s.total_steps = s.total_steps.max(s.current_step);
            s.description = description;
        });
    }

    fn update(&self, f: impl FnOnce(&mut ProgressSnapshot)) {
        self.inner.tx.send_if_modified(|state| {
            if state.snapshot.is_terminal() {
                trace!(progress = %self.inner.id, "update after terminal state ignored");
                return false;
            }
            f(&mut state.snapshot);
            true
        });
    }

    // ── Terminal transitions ─────────────────────────────────────

    pub fn set_complete(&self) {
        self.finish(Outcome::Complete(None));
    }

    pub fn set_complete_with(&self, result: TaskOutput) {
        self.finish(Outcome::Complete(Some(result)));
    }

    pub fn set_error(&self, err: CoreError) {
        self.finish(Outcome::Error(err));
    }

    fn finish(&self, outcome: Outcome) {
        self.inner.tx.send_if_modified(|state| {
            if state.snapshot.is_terminal() {
                return false;
            }
            state.staged = None;
            state.snapshot.finish(outcome);
            true
        });
    }

    // ── Deferred publication ─────────────────────────────────────

    /// Stage completion without waking anyone. Published by [`commit`](Self::commit).
    pub fn set_uncommitted_complete(&self) {
        self.stage(Outcome::Complete(None));
    }

    pub fn set_uncommitted_complete_with(&self, result: TaskOutput) {
        self.stage(Outcome::Complete(Some(result)));
    }

    pub fn set_uncommitted_error(&self, err: CoreError) {
        self.stage(Outcome::Error(err));
    }

    fn stage(&self, outcome: Outcome) {
        self.inner.tx.send_if_modified(|state| {
            if !state.snapshot.is_terminal() {
                state.staged = Some(outcome);
            }
            false
        });
    }

    pub fn has_uncommitted(&self) -> bool {
        self.inner.tx.borrow().staged.is_some()
    }

    /// Atomically publish the staged outcome and wake all waiters.
    /// No-op when nothing is staged.
    pub fn commit(&self) {
        self.inner.tx.send_if_modified(|state| match state.staged.take() {
            Some(outcome) if !state.snapshot.is_terminal() => {
                state.snapshot.finish(outcome);
                true
            }
            _ => false,
        });
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn subscribe(&self) -> ProgressWatcher {
        ProgressWatcher {
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Wait until the operation completes or fails.
    pub async fn wait_for_end(&self) -> ProgressSnapshot {
        let mut rx = self.inner.tx.subscribe();
        match rx.wait_for(|s| s.snapshot.is_terminal()).await {
            Ok(state) => state.snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Mirror `other` onto this container until it terminates.
    ///
    /// Steps and total steps reported by `other` are added to this
    /// container as they happen. With `merge_at_end`, the followed result
    /// or error becomes this container's terminal state. Returns the final
    /// snapshot of `other`.
    pub async fn follow(&self, other: &ProgressContainer, merge_at_end: bool) -> ProgressSnapshot {
        let mut watcher = other.subscribe();
        let mut projected_total = 0u32;
        let mut projected_current = 0u32;

        loop {
            let snap = watcher.current();
            let total = snap.total_steps.max(snap.current_step);
            if total > projected_total {
                self.increment_total_steps(total - projected_total);
                projected_total = total;
            }
            if snap.current_step > projected_current {
                self.increment_current_step(
                    snap.current_step - projected_current,
                    snap.description.clone(),
                );
                projected_current = snap.current_step;
            }

            if snap.is_terminal() {
                if merge_at_end {
                    match (&snap.error, &snap.result) {
                        (Some(err), _) => self.set_error(err.clone()),
                        (None, Some(result)) => self.set_complete_with(result.clone()),
                        (None, None) => self.set_complete(),
                    }
                }
                return snap;
            }

            if watcher.wait_for_update().await.is_none() {
                return other.snapshot();
            }
        }
    }
}

impl std::fmt::Debug for ProgressContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressContainer")
            .field("id", &self.inner.id)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// A consumer's view on a [`ProgressContainer`], tracking which updates it
/// has already seen.
pub struct ProgressWatcher {
    rx: watch::Receiver<ProgressState>,
}

impl ProgressWatcher {
    /// `true` if the container changed since this watcher last looked.
    pub fn has_update(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Latest snapshot, marking it as seen.
    pub fn current(&mut self) -> ProgressSnapshot {
        self.rx.borrow_and_update().snapshot.clone()
    }

    /// Wait for the next change. `None` once the container is gone.
    pub async fn wait_for_update(&mut self) -> Option<ProgressSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.current())
    }

    pub async fn wait_for_end(&mut self) -> ProgressSnapshot {
        let done = match self.rx.wait_for(|s| s.snapshot.is_terminal()).await {
            Ok(state) => Some(state.snapshot.clone()),
            Err(_) => None,
        };
        // Sender gone: the last published state is all there will be.
        done.unwrap_or_else(|| self.rx.borrow().snapshot.clone())
    }
}
