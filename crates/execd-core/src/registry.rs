//! Execution registry: admission, state transitions, retention
//!
//! The registry is the single authority over execution state. Everything else
//! (launcher, supervisor, HTTP layer) reports events or reads snapshots; no
//! component mutates a record directly, so concurrent completions cannot race
//! each other into an inconsistent state.
//!
//! Capacity accounting: `admit` reserves a slot while the record is still
//! Pending, so two concurrent admissions can never both squeeze past the cap;
//! the Running count therefore never exceeds it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{ExecError, Result};
use crate::relay::LogBuffer;
use crate::types::{ExecutionRequest, ExecutionSnapshot, ExecutionState, ExitInfo};

struct ExecutionRecord {
    request: ExecutionRequest,
    state: ExecutionState,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    exit_info: Option<ExitInfo>,
    cancel: CancellationToken,
    logs: Arc<LogBuffer>,
}

impl ExecutionRecord {
    fn snapshot(&self, id: Uuid) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id,
            request: self.request.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            exit_info: self.exit_info.clone(),
        }
    }

    fn occupies_slot(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// Tracks in-flight and completed executions and enforces the concurrency cap.
pub struct ExecutionRegistry {
    executions: Mutex<HashMap<Uuid, ExecutionRecord>>,
    cap: usize,
    retention: Duration,
}

impl ExecutionRegistry {
    pub fn new(cap: usize, retention: Duration) -> Self {
        Self {
            executions: Mutex::new(HashMap::new()),
            cap,
            retention,
        }
    }

    /// Admit a new execution, reserving a capacity slot.
    ///
    /// Overflow policy is reject, not queue: once Pending+Running occupancy
    /// reaches the cap, admission fails with `CapacityExceeded`.
    pub fn admit(&self, request: ExecutionRequest) -> Result<Uuid> {
        let mut executions = self.executions.lock().expect("registry poisoned");
        let occupied = executions.values().filter(|r| r.occupies_slot()).count();
        if occupied >= self.cap {
            return Err(ExecError::CapacityExceeded {
                running: occupied,
                cap: self.cap,
            });
        }
        let id = Uuid::new_v4();
        executions.insert(
            id,
            ExecutionRecord {
                request,
                state: ExecutionState::Pending,
                started_at: Utc::now(),
                ended_at: None,
                exit_info: None,
                cancel: CancellationToken::new(),
                logs: LogBuffer::new(),
            },
        );
        log::info!("admitted execution {} ({}/{} slots)", id, occupied + 1, self.cap);
        Ok(id)
    }

    /// Report that the container started.
    pub fn mark_running(&self, id: Uuid) -> Result<()> {
        self.transition(id, ExecutionState::Running, None)
    }

    /// Report a terminal outcome, releasing the capacity slot.
    pub fn complete(&self, id: Uuid, state: ExecutionState, exit_info: ExitInfo) -> Result<()> {
        debug_assert!(state.is_terminal());
        self.transition(id, state, Some(exit_info))
    }

    fn transition(&self, id: Uuid, next: ExecutionState, exit_info: Option<ExitInfo>) -> Result<()> {
        let mut executions = self.executions.lock().expect("registry poisoned");
        let record = executions
            .get_mut(&id)
            .ok_or_else(|| ExecError::not_found(format!("execution {}", id)))?;
        if !record.state.can_transition_to(next) {
            // A refused transition is a bug in the reporting component, not
            // a caller error; leave the record untouched.
            log::error!(
                "refused transition {} -> {} for execution {}",
                record.state,
                next,
                id
            );
            return Err(ExecError::internal(format!(
                "illegal state transition for execution {}",
                id
            )));
        }
        log::info!("execution {}: {} -> {}", id, record.state, next);
        record.state = next;
        if next.is_terminal() {
            record.ended_at = Some(Utc::now());
            record.exit_info = exit_info;
            record.logs.close();
        }
        Ok(())
    }

    /// Current state and exit info. Idempotent after termination.
    pub fn observe(&self, id: Uuid) -> Result<ExecutionSnapshot> {
        let executions = self.executions.lock().expect("registry poisoned");
        executions
            .get(&id)
            .map(|r| r.snapshot(id))
            .ok_or_else(|| ExecError::not_found(format!("execution {}", id)))
    }

    /// Request cancellation of a live execution.
    ///
    /// Returns once the request is recorded; the supervisor performs the
    /// actual termination and reports the Cancelled transition.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let executions = self.executions.lock().expect("registry poisoned");
        let record = executions
            .get(&id)
            .ok_or_else(|| ExecError::not_found(format!("execution {}", id)))?;
        if record.state.is_terminal() {
            return Err(ExecError::AlreadyTerminal(id));
        }
        log::info!("cancellation requested for execution {}", id);
        record.cancel.cancel();
        Ok(())
    }

    /// Cancellation token for the supervisor of `id`.
    pub fn cancellation_token(&self, id: Uuid) -> Result<CancellationToken> {
        let executions = self.executions.lock().expect("registry poisoned");
        executions
            .get(&id)
            .map(|r| r.cancel.clone())
            .ok_or_else(|| ExecError::not_found(format!("execution {}", id)))
    }

    /// Log buffer for `id`, for the relay and the launcher's sink.
    pub fn log_buffer(&self, id: Uuid) -> Result<Arc<LogBuffer>> {
        let executions = self.executions.lock().expect("registry poisoned");
        executions
            .get(&id)
            .map(|r| r.logs.clone())
            .ok_or_else(|| ExecError::not_found(format!("execution {}", id)))
    }

    /// Number of executions currently occupying capacity slots.
    pub fn occupancy(&self) -> usize {
        let executions = self.executions.lock().expect("registry poisoned");
        executions.values().filter(|r| r.occupies_slot()).count()
    }

    /// Evict terminal records older than the retention window.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
        let mut executions = self.executions.lock().expect("registry poisoned");
        let before = executions.len();
        executions.retain(|id, record| {
            let expired = record.state.is_terminal()
                && record.ended_at.map(|t| t < cutoff).unwrap_or(false);
            if expired {
                log::debug!("evicting terminal execution {}", id);
            }
            !expired
        });
        before - executions.len()
    }

    /// Spawn the periodic retention sweep.
    pub fn spawn_retention_sweep(self: Arc<Self>, interval: Duration) {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.sweep_expired();
                if evicted > 0 {
                    log::info!("retention sweep evicted {} executions", evicted);
                }
            }
        });
    }
}
