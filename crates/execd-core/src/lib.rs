//! Core library for execd, a managed script-execution service
//!
//! Given a bucket and key, execd fetches a script from S3-compatible object
//! storage, stages it into a disposable workspace, and runs it inside an
//! ephemeral Docker container under resource limits. Executions are tracked
//! end-to-end by a registry that enforces a concurrency cap and monotonic
//! lifecycle transitions; output is retained and streamable while the run is
//! live and after it terminates. Workspaces and containers are reclaimed on
//! every exit path.

pub mod config;
pub mod errors;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod service;
pub mod staging;
pub mod storage;
pub mod types;

pub use config::ExecdConfig;
pub use errors::{ExecError, Result};
pub use registry::ExecutionRegistry;
pub use relay::{LogBuffer, LogSink};
pub use runtime::{DockerRuntime, LaunchSpec, RunningScript, ScriptRuntime};
pub use service::ExecutionService;
pub use staging::{StagingArea, Workspace};
pub use storage::{HttpObjectStore, ObjectStore};
pub use types::{
    ExecutionRequest, ExecutionSnapshot, ExecutionState, ExitInfo, NetworkMode, ResourceLimits,
};
