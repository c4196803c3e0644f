// ── Core error types ──
//
// Errors surfaced by fleetsync-core. Device protocol failures arrive as
// `fleetsync_api::Error` and are translated here into the manager's own
// taxonomy; callers classify them with `CoreError::kind()` rather than
// matching individual variants.

use thiserror::Error;

/// Coarse classification used to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ErrorKind {
    /// Lock contention. Always recoverable by trying again later.
    Busy,
    /// Device communication failed. The next heartbeat/sync pass retries.
    Transient,
    /// The device no longer is what it claimed to be.
    StructuralMismatch,
    /// Linked deployment policy does not match the source version.
    PolicyMismatch,
    /// Synchronization retry budget exhausted; domain demoted to manual.
    RetryExhausted,
    /// Task never ran because the manager shut down.
    ShutdownDiscard,
    NotFound,
    Deleted,
    /// Caller asked for something the current state does not allow.
    Invalid,
    Internal,
}

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Contention ───────────────────────────────────────────────────
    #[error("{entity} is busy, retry later")]
    Busy { entity: String },

    #[error("Work queue for {work_area} is full ({capacity} tasks pending)")]
    QueueFull { work_area: String, capacity: usize },

    // ── Device communication ─────────────────────────────────────────
    #[error("Cannot reach device at {host}: {reason}")]
    DeviceUnreachable { host: String, reason: String },

    #[error("Credentials rejected by device at {host}: {message}")]
    CredentialsRejected { host: String, message: String },

    #[error("Device failed to execute {operation}: {message}")]
    RemoteExecution { operation: String, message: String },

    #[error("Timed out after {timeout_secs}s waiting for {operation}")]
    Timeout { operation: String, timeout_secs: u64 },

    // ── Fatal per-entity conditions ──────────────────────────────────
    #[error("Device {serial} no longer matches its managed identity: {detail}")]
    StructuralMismatch { serial: String, detail: String },

    #[error(
        "Deployment policy version for domain {domain} does not match the source version timestamp"
    )]
    PolicyMismatch { domain: String },

    #[error(
        "Domain {domain} could not be synchronized after {attempts} attempts; synchronization mode set to manual (last error: {last_error})"
    )]
    Undeployable {
        domain: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Task {task} discarded due to manager shutdown")]
    ShutdownDiscarded { task: String },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: String,
        identifier: String,
    },

    #[error("{entity_type} {identifier} has been deleted")]
    Deleted {
        entity_type: String,
        identifier: String,
    },

    #[error("{entity_type} already exists: {identifier}")]
    AlreadyExists {
        entity_type: String,
        identifier: String,
    },

    #[error("Configuration source {url} unavailable: {reason}")]
    SourceUnavailable { url: String, reason: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy { .. } | Self::QueueFull { .. } => ErrorKind::Busy,
            Self::DeviceUnreachable { .. }
            | Self::CredentialsRejected { .. }
            | Self::RemoteExecution { .. }
            | Self::Timeout { .. }
            | Self::SourceUnavailable { .. } => ErrorKind::Transient,
            Self::StructuralMismatch { .. } => ErrorKind::StructuralMismatch,
            Self::PolicyMismatch { .. } => ErrorKind::PolicyMismatch,
            Self::Undeployable { .. } => ErrorKind::RetryExhausted,
            Self::ShutdownDiscarded { .. } => ErrorKind::ShutdownDiscard,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Deleted { .. } => ErrorKind::Deleted,
            Self::AlreadyExists { .. } | Self::ValidationFailed { .. } | Self::Unsupported { .. } => {
                ErrorKind::Invalid
            }
            Self::Persistence { .. } | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if a later scheduled pass may succeed without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Busy | ErrorKind::Transient)
    }

    pub(crate) fn not_found(entity_type: &str, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            identifier: identifier.into(),
        }
    }

    pub(crate) fn deleted(entity_type: &str, identifier: impl Into<String>) -> Self {
        Self::Deleted {
            entity_type: entity_type.into(),
            identifier: identifier.into(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

// ── Conversion from device protocol errors ───────────────────────────

impl From<fleetsync_api::Error> for CoreError {
    fn from(err: fleetsync_api::Error) -> Self {
        match err {
            fleetsync_api::Error::Transport { host, reason } => {
                CoreError::DeviceUnreachable { host, reason }
            }
            fleetsync_api::Error::Timeout { host, timeout_secs } => CoreError::Timeout {
                operation: format!("response from {host}"),
                timeout_secs,
            },
            fleetsync_api::Error::Credentials { host, message } => {
                CoreError::CredentialsRejected { host, message }
            }
            fleetsync_api::Error::RemoteExecution { operation, message } => {
                CoreError::RemoteExecution { operation, message }
            }
            fleetsync_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            fleetsync_api::Error::UnsupportedOperation(op) => CoreError::Unsupported {
                operation: op.to_string(),
            },
        }
    }
}
