//! Error taxonomy for the execution service
//!
//! Every failure a caller can observe maps to exactly one `ExecError` kind, and
//! every kind maps to a distinct HTTP status. Messages are written for the
//! caller: no filesystem paths, no credentials, no container ids beyond the
//! execution id the caller already holds.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for execution-service operations.
pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Error, Debug)]
pub enum ExecError {
    /// Object, bucket, or execution id does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage refused the read
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Storage failed in a way worth retrying; surfaced only after retries exhaust
    #[error("transient storage error: {0}")]
    TransientStorage(String),

    /// Workspace creation or script write failed
    #[error("staging failed: {0}")]
    StagingIo(String),

    /// Container runtime unavailable, image missing, or create/start refused
    #[error("launch failed: {0}")]
    Launch(String),

    /// Admission refused: concurrency cap reached
    #[error("capacity exceeded: {running} of {cap} execution slots in use")]
    CapacityExceeded { running: usize, cap: usize },

    /// Execution exceeded its wall-clock timeout
    #[error("execution timed out")]
    TimedOut,

    /// Execution was cancelled by the caller
    #[error("execution cancelled by caller")]
    Cancelled,

    /// Cancellation requested for an execution already in a terminal state
    #[error("execution {0} is already terminal")]
    AlreadyTerminal(Uuid),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// Create a new not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a new access-denied error.
    pub fn access_denied(what: impl Into<String>) -> Self {
        Self::AccessDenied(what.into())
    }

    /// Create a new transient storage error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientStorage(msg.into())
    }

    /// Create a new staging error.
    pub fn staging(msg: impl Into<String>) -> Self {
        Self::StagingIo(msg.into())
    }

    /// Create a new launch error.
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::TransientStorage(_))
    }

    /// Stable machine-readable kind, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::NotFound(_) => "not_found",
            ExecError::AccessDenied(_) => "access_denied",
            ExecError::TransientStorage(_) => "transient_storage_error",
            ExecError::StagingIo(_) => "staging_io_error",
            ExecError::Launch(_) => "launch_error",
            ExecError::CapacityExceeded { .. } => "capacity_exceeded",
            ExecError::TimedOut => "timed_out",
            ExecError::Cancelled => "cancelled_by_caller",
            ExecError::AlreadyTerminal(_) => "already_terminal",
            ExecError::Internal(_) => "internal_fault",
        }
    }

    /// HTTP status this kind surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            ExecError::NotFound(_) => 404,
            ExecError::AccessDenied(_) => 403,
            ExecError::TransientStorage(_) | ExecError::Launch(_) => 502,
            ExecError::StagingIo(_) | ExecError::Internal(_) => 500,
            ExecError::CapacityExceeded { .. } => 429,
            ExecError::TimedOut => 504,
            ExecError::Cancelled => 409,
            ExecError::AlreadyTerminal(_) => 409,
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::StagingIo(err.to_string())
    }
}
