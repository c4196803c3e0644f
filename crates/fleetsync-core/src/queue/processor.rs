// ── QueueProcessor ──
//
// The one dedicated executor. Picks a ready item, runs it to completion,
// repeats. Never runs two items concurrently.

use strum::Display;
use tracing::{debug, info, warn};

use super::Next;
use crate::dispatch;
use crate::manager::Manager;

/// Lifecycle of the processor: `Stopped -> Running -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProcessorState {
    Stopped,
    Running,
    Draining,
}

pub(crate) async fn run_processor(manager: Manager) {
    let monitor = manager.monitor();
    monitor.set_processor_state(ProcessorState::Running);
    info!("queue processor started");

    loop {
        match monitor.next().await {
            Next::Shutdown => break,
            Next::Task(area, task) => {
                debug!(work_area = %area, task = %task.describe(), "executing task");
                task.execute(&manager).await;
            }
            Next::Notification(area, released) => {
                dispatch::handle_notification(&manager, &area, released).await;
            }
            Next::Idle { buffered: false } => monitor.wakeup.notified().await,
            Next::Idle { buffered: true } => {
                // Held-back notifications become ready on their own once the
                // reorder window passes.
                let repoll = monitor.window().await / 2;
                tokio::select! {
                    () = monitor.wakeup.notified() => {}
                    () = tokio::time::sleep(repoll) => {}
                }
            }
        }
    }

    drain_for_shutdown(&manager).await;
}

/// Resolve everything still queued: unsubscribe-all tasks run, the rest
/// fail with `ShutdownDiscarded`, notifications are dropped.
pub(crate) async fn drain_for_shutdown(manager: &Manager) {
    let monitor = manager.monitor();
    monitor.set_processor_state(ProcessorState::Draining);

    let (tasks, dropped_notifications) = monitor.drain().await;
    let (final_tasks, discarded): (Vec<_>, Vec<_>) =
        tasks.into_iter().partition(|t| t.runs_during_shutdown());

    if !discarded.is_empty() || dropped_notifications > 0 {
        warn!(
            tasks = discarded.len(),
            notifications = dropped_notifications,
            "discarding queued work due to shutdown"
        );
    }
    for task in discarded {
        task.discard();
    }
    for task in final_tasks {
        task.execute(manager).await;
    }

    monitor.set_processor_state(ProcessorState::Stopped);
    info!("queue processor stopped");
}
