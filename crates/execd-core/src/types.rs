//! Core data types shared across the service
//!
//! The lifecycle of one execution is captured by `ExecutionState`: states only
//! move forward, and the four terminal states admit no further transitions.
//! `ExecutionSnapshot` is the read-only view handed to callers; the registry
//! owns the mutable records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// One incoming request naming a script in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub bucket: String,
    pub key: String,
}

impl ExecutionRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Admitted, container not yet started; reserves a capacity slot
    Pending,
    /// Container started and not yet exited
    Running,
    /// Container exited with code 0
    Succeeded,
    /// Container exited nonzero, or launch failed after admission
    Failed,
    /// Forcibly terminated on wall-timeout expiry
    TimedOut,
    /// Forcibly terminated on caller request
    Cancelled,
}

impl ExecutionState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::Cancelled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        match (self, next) {
            (ExecutionState::Pending, ExecutionState::Running) => true,
            // Launch failure terminates a Pending execution directly.
            (ExecutionState::Pending, ExecutionState::Failed) => true,
            (ExecutionState::Running, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// How the container left this world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code reported by the runtime, if it got far enough to have one
    pub exit_code: Option<i64>,
    /// Short caller-safe description of the failure, if any
    pub message: Option<String>,
}

impl ExitInfo {
    pub fn with_code(exit_code: i64) -> Self {
        Self {
            exit_code: Some(exit_code),
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            message: Some(message.into()),
        }
    }
}

/// Read-only view of one execution, as returned by `observe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: Uuid,
    pub request: ExecutionRequest,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_info: Option<ExitInfo>,
}

/// Network access granted to the launched container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No network interface at all
    #[default]
    None,
    /// Default bridge network, no extra capabilities
    Restricted,
}

impl NetworkMode {
    /// Docker network mode string.
    pub fn as_docker_mode(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Restricted => "bridge",
        }
    }
}

/// Resource bounds applied to every launched container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Relative CPU weight (docker cpu-shares)
    pub cpu_shares: i64,
    /// Hard RSS cap in bytes
    pub memory_cap: i64,
    /// Maximum wall-clock runtime before forcible termination
    pub wall_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on termination
    pub grace: Duration,
    pub network_mode: NetworkMode,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_shares: 512,
            memory_cap: 256 * 1024 * 1024,
            wall_timeout: Duration::from_secs(300),
            grace: Duration::from_secs(5),
            network_mode: NetworkMode::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_terminal() {
        assert!(ExecutionState::Succeeded.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::TimedOut.is_terminal());
        assert!(ExecutionState::Cancelled.is_terminal());
        assert!(!ExecutionState::Pending.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
    }

    #[test]
    fn transitions_are_monotonic() {
        use ExecutionState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(TimedOut));

        // Nothing leaves a terminal state, and nothing goes backwards.
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Succeeded));
    }

    #[test]
    fn network_mode_maps_to_docker_strings() {
        assert_eq!(NetworkMode::None.as_docker_mode(), "none");
        assert_eq!(NetworkMode::Restricted.as_docker_mode(), "bridge");
    }
}
