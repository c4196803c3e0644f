use thiserror::Error;

/// Top-level error type for the `fleetsync-api` crate.
///
/// Every failure a [`DeviceCommandClient`](crate::DeviceCommandClient)
/// implementation can report. `fleetsync-core` maps these into its own
/// error taxonomy and decides whether a later pass should retry.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// The device could not be reached (connection refused, DNS failure,
    /// dropped connection, ...).
    #[error("Transport error talking to {host}: {reason}")]
    Transport { host: String, reason: String },

    /// The device did not answer within the allotted time.
    #[error("Request to {host} timed out after {timeout_secs}s")]
    Timeout { host: String, timeout_secs: u64 },

    // ── Authentication ──────────────────────────────────────────────
    /// The device rejected the configured credentials.
    #[error("Credentials rejected by {host}: {message}")]
    Credentials { host: String, message: String },

    // ── Remote execution ────────────────────────────────────────────
    /// The device accepted the request but failed to carry it out.
    #[error("{operation} failed on device: {message}")]
    RemoteExecution { operation: String, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// A payload (notification, status document) could not be decoded.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Capability ──────────────────────────────────────────────────
    /// Operation not supported by this device or client.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
}

impl Error {
    /// Returns `true` if this is a communication failure that a later
    /// pass is expected to get past without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Returns `true` if the device refused our credentials.
    pub fn is_credentials(&self) -> bool {
        matches!(self, Self::Credentials { .. })
    }
}
