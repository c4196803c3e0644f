// ── Runtime manager configuration ──
//
// Tuning knobs for the dispatcher, synchronization and polling loops.
// Hosts build a `ManagerConfig` (directly or via fleetsync-config) and hand
// it to `Manager::new` -- core never reads config files.

use std::time::Duration;

/// Configuration for one [`Manager`](crate::Manager) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Consecutive failed synchronization attempts before a domain is
    /// demoted to manual mode.
    pub max_synch_retry_count: u32,
    /// Domain versions retained per domain; oldest are trimmed first.
    pub max_domain_versions: usize,
    /// Firmware versions retained per firmware family.
    pub max_firmware_versions: usize,
    /// Bound on each work area's background-task queue.
    pub task_queue_capacity: usize,
    /// How long an out-of-order notification is held back waiting for the
    /// missing sequence numbers.
    pub reorder_window: Duration,
    /// Period of the heartbeat timer. Zero disables it.
    pub heartbeat_interval: Duration,
    /// Per-heartbeat device response timeout.
    pub heartbeat_timeout: Duration,
    /// Period of the domain synchronization timer. Zero disables it.
    pub domain_sync_interval: Duration,
    /// Poll cadence while waiting for a domain to quiesce.
    pub quiesce_poll_interval: Duration,
    /// Quiesce timeout given to newly created domains.
    pub default_quiesce_timeout: Duration,
    /// Upper bound on a firmware install, reboot included.
    pub firmware_deploy_timeout: Duration,
    /// Poll cadence while waiting for a device to come back with new firmware.
    pub firmware_poll_interval: Duration,
    /// Callback URL devices push notifications to.
    pub notification_callback: String,
    /// Oldest firmware level that supports domain quiesce.
    pub min_firmware_for_quiesce: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_synch_retry_count: 3,
            max_domain_versions: 3,
            max_firmware_versions: 2,
            task_queue_capacity: 64,
            reorder_window: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(300),
            heartbeat_timeout: Duration::from_secs(30),
            domain_sync_interval: Duration::from_secs(600),
            quiesce_poll_interval: Duration::from_secs(2),
            default_quiesce_timeout: Duration::from_secs(60),
            firmware_deploy_timeout: Duration::from_secs(30 * 60),
            firmware_poll_interval: Duration::from_secs(10),
            notification_callback: "http://localhost:5555/notifications".into(),
            min_firmware_for_quiesce: "3.8.1".into(),
        }
    }
}
