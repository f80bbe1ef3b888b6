//! Execution launcher seam
//!
//! `ScriptRuntime` is the trait boundary between the service and the container
//! runtime; the production implementation is Docker via bollard, tests use
//! in-process doubles. A launch binds a workspace read-write into an isolated
//! context and starts it detached; the returned `RunningScript` is what the
//! supervisor waits on and terminates.

pub mod docker;

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::Result;
use crate::relay::LogSink;
use crate::staging::Workspace;
use crate::types::{ExitInfo, ResourceLimits};

pub use docker::DockerRuntime;

/// Everything the runtime needs to start one execution.
pub struct LaunchSpec<'a> {
    /// Execution id; the container name is derived from it and never reused
    pub execution_id: Uuid,
    pub workspace: &'a Workspace,
    pub limits: &'a ResourceLimits,
    /// Destination for the container's stdout/stderr lines
    pub logs: LogSink,
}

/// A started, detached execution context.
#[async_trait]
pub trait RunningScript: Send {
    /// Resolve when the context exits, with its exit information.
    async fn wait(&mut self) -> Result<ExitInfo>;

    /// Terminate the context: signal, wait `grace`, then force-kill.
    ///
    /// Idempotent with respect to an already-exited context.
    async fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// Launches sandboxed script executions.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Create and start an isolated context for the staged script.
    ///
    /// The context must remove its own runtime artifacts when it exits,
    /// whatever the exit code; cleanup never depends on a separate reaper.
    async fn launch(&self, spec: LaunchSpec<'_>) -> Result<Box<dyn RunningScript>>;
}
