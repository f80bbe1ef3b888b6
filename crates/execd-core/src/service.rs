//! Execution service: fetch, stage, admit, launch, supervise
//!
//! `execute` returns as soon as the container has been started; a spawned
//! supervisor owns the rest of the lifecycle. Whatever branch the supervisor
//! takes (exit, wall-timeout, cancellation, wait error), it reports the
//! terminal state to the registry and releases the workspace. Cleanup is
//! unconditional: the workspace is moved into the supervisor, and on the
//! failure paths before the supervisor exists it is dropped or released in
//! place, so no directory survives its execution.

use futures_util::Stream;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::Result;
use crate::registry::ExecutionRegistry;
use crate::relay::{stream_lines, LogSink};
use crate::runtime::{LaunchSpec, RunningScript, ScriptRuntime};
use crate::staging::{StagingArea, Workspace};
use crate::storage::{fetch_with_retry, ObjectStore};
use crate::types::{ExecutionRequest, ExecutionSnapshot, ExecutionState, ExitInfo, ResourceLimits};

pub struct ExecutionService {
    store: Arc<dyn ObjectStore>,
    runtime: Arc<dyn ScriptRuntime>,
    registry: Arc<ExecutionRegistry>,
    staging: Arc<StagingArea>,
    limits: ResourceLimits,
}

impl ExecutionService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        runtime: Arc<dyn ScriptRuntime>,
        registry: Arc<ExecutionRegistry>,
        staging: StagingArea,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            store,
            runtime,
            registry,
            staging: Arc::new(staging),
            limits,
        }
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// Run one script: returns the execution id once the container is started.
    ///
    /// Failure behavior, in pipeline order: fetch errors leave no trace (no
    /// workspace, no record); admission failure releases the staged workspace;
    /// launch failure marks the admitted record Failed, releases the
    /// workspace, and surfaces the launch error.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<Uuid> {
        let content = fetch_with_retry(self.store.as_ref(), &request.bucket, &request.key).await?;
        log::info!(
            "fetched {} bytes for {}/{}",
            content.len(),
            request.bucket,
            request.key
        );

        let workspace = self.staging.stage(&request.key, &content).await?;

        let id = match self.registry.admit(request) {
            Ok(id) => id,
            Err(e) => {
                self.staging.release(workspace);
                return Err(e);
            }
        };

        let logs = LogSink::new(self.registry.log_buffer(id)?);
        let spec = LaunchSpec {
            execution_id: id,
            workspace: &workspace,
            limits: &self.limits,
            logs,
        };

        let running = match self.runtime.launch(spec).await {
            Ok(running) => running,
            Err(e) => {
                let _ = self.registry.complete(
                    id,
                    ExecutionState::Failed,
                    ExitInfo::with_message(e.to_string()),
                );
                self.staging.release(workspace);
                return Err(e);
            }
        };

        self.registry.mark_running(id)?;
        self.spawn_supervisor(id, running, workspace);
        Ok(id)
    }

    /// Current state and exit info of one execution.
    pub fn status(&self, id: Uuid) -> Result<ExecutionSnapshot> {
        self.registry.observe(id)
    }

    /// Request cooperative cancellation of a live execution.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        self.registry.cancel(id)
    }

    /// Lazy log stream from the first retained line; finite once terminal.
    pub fn stream_logs(&self, id: Uuid) -> Result<impl Stream<Item = String>> {
        Ok(stream_lines(self.registry.log_buffer(id)?))
    }

    fn spawn_supervisor(
        &self,
        id: Uuid,
        mut running: Box<dyn RunningScript>,
        workspace: Workspace,
    ) {
        let registry = Arc::clone(&self.registry);
        let staging = Arc::clone(&self.staging);
        let wall_timeout = self.limits.wall_timeout;
        let grace = self.limits.grace;
        let cancel = match self.registry.cancellation_token(id) {
            Ok(token) => token,
            Err(_) => return,
        };

        tokio::spawn(async move {
            enum Outcome {
                Exited(Result<ExitInfo>),
                TimedOut,
                Cancelled,
            }

            let outcome = tokio::select! {
                result = running.wait() => Outcome::Exited(result),
                _ = tokio::time::sleep(wall_timeout) => Outcome::TimedOut,
                _ = cancel.cancelled() => Outcome::Cancelled,
            };

            let (state, exit_info) = match outcome {
                Outcome::Exited(Ok(exit)) => {
                    let state = if exit.exit_code == Some(0) {
                        ExecutionState::Succeeded
                    } else {
                        ExecutionState::Failed
                    };
                    (state, exit)
                }
                Outcome::Exited(Err(e)) => {
                    log::error!("wait on execution {} failed: {}", id, e);
                    (ExecutionState::Failed, ExitInfo::with_message(e.to_string()))
                }
                Outcome::TimedOut => {
                    log::warn!("execution {} hit wall timeout after {:?}", id, wall_timeout);
                    terminate_quietly(running.as_mut(), grace, id).await;
                    (
                        ExecutionState::TimedOut,
                        ExitInfo::with_message("wall timeout exceeded"),
                    )
                }
                Outcome::Cancelled => {
                    terminate_quietly(running.as_mut(), grace, id).await;
                    (
                        ExecutionState::Cancelled,
                        ExitInfo::with_message("cancelled by caller"),
                    )
                }
            };

            if let Err(e) = registry.complete(id, state, exit_info) {
                log::error!("failed to record outcome of execution {}: {}", id, e);
            }
            staging.release(workspace);
        });
    }
}

async fn terminate_quietly(running: &mut dyn RunningScript, grace: Duration, id: Uuid) {
    if let Err(e) = running.terminate(grace).await {
        log::error!("terminating execution {} failed: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecError;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    struct MapStore {
        objects: Vec<(&'static str, &'static str, &'static [u8])>,
    }

    impl MapStore {
        fn with_job_script() -> Self {
            Self {
                objects: vec![("scripts", "job.py", b"print('hi')" as &[u8])],
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MapStore {
        async fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.objects
                .iter()
                .find(|(b, k, _)| *b == bucket && *k == key)
                .map(|(_, _, bytes)| bytes.to_vec())
                .ok_or_else(|| ExecError::not_found(format!("object {}/{}", bucket, key)))
        }
    }

    /// Script double whose exit is controlled by the test through a channel.
    struct ScriptedRun {
        exit: Option<oneshot::Receiver<ExitInfo>>,
        terminated: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl RunningScript for ScriptedRun {
        async fn wait(&mut self) -> Result<ExitInfo> {
            match self.exit.take() {
                Some(rx) => rx
                    .await
                    .map_err(|_| ExecError::internal("exit channel dropped")),
                None => std::future::pending().await,
            }
        }

        async fn terminate(&mut self, _grace: Duration) -> Result<()> {
            *self.terminated.lock().unwrap() = true;
            Ok(())
        }
    }

    /// Runtime double: hands out scripted runs, records launch inputs.
    struct FakeRuntime {
        exits: Mutex<Vec<oneshot::Receiver<ExitInfo>>>,
        terminated: Arc<Mutex<bool>>,
        seen_workspaces: Arc<Mutex<Vec<PathBuf>>>,
        fail_launch: bool,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self {
                exits: Mutex::new(Vec::new()),
                terminated: Arc::new(Mutex::new(false)),
                seen_workspaces: Arc::new(Mutex::new(Vec::new())),
                fail_launch: false,
            }
        }

        fn with_exit(self, rx: oneshot::Receiver<ExitInfo>) -> Self {
            self.exits.lock().unwrap().push(rx);
            self
        }
    }

    #[async_trait]
    impl ScriptRuntime for FakeRuntime {
        async fn launch(&self, spec: LaunchSpec<'_>) -> Result<Box<dyn RunningScript>> {
            if self.fail_launch {
                return Err(ExecError::launch("image missing"));
            }
            self.seen_workspaces
                .lock()
                .unwrap()
                .push(spec.workspace.root().to_path_buf());
            spec.logs.push("container started");
            Ok(Box::new(ScriptedRun {
                exit: self.exits.lock().unwrap().pop(),
                terminated: self.terminated.clone(),
            }))
        }
    }

    fn service_with(
        store: MapStore,
        runtime: FakeRuntime,
        cap: usize,
        limits: ResourceLimits,
    ) -> ExecutionService {
        ExecutionService::new(
            Arc::new(store),
            Arc::new(runtime),
            Arc::new(ExecutionRegistry::new(cap, Duration::from_secs(3600))),
            StagingArea::new(),
            limits,
        )
    }

    fn script_store() -> MapStore {
        MapStore::with_job_script()
    }

    async fn wait_for_terminal(service: &ExecutionService, id: Uuid) -> ExecutionSnapshot {
        for _ in 0..200 {
            let snap = service.status(id).unwrap();
            if snap.state.is_terminal() {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution {} never reached a terminal state", id);
    }

    async fn assert_workspace_removed(seen: &Arc<Mutex<Vec<PathBuf>>>) {
        let path = seen.lock().unwrap().first().cloned().expect("launch recorded");
        for _ in 0..200 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workspace {} still exists after terminal state", path.display());
    }

    #[tokio::test]
    async fn successful_run_succeeds_and_releases_the_workspace() {
        let (tx, rx) = oneshot::channel();
        let runtime = FakeRuntime::new().with_exit(rx);
        let seen = runtime.seen_workspaces.clone();
        let service = service_with(script_store(), runtime, 4, ResourceLimits::default());

        let id = service
            .execute(ExecutionRequest::new("scripts", "job.py"))
            .await
            .unwrap();
        assert_eq!(service.status(id).unwrap().state, ExecutionState::Running);

        tx.send(ExitInfo::with_code(0)).unwrap();
        let snap = wait_for_terminal(&service, id).await;
        assert_eq!(snap.state, ExecutionState::Succeeded);
        assert_eq!(snap.exit_info, Some(ExitInfo::with_code(0)));
        assert_workspace_removed(&seen).await;
    }

    #[tokio::test]
    async fn failed_run_also_releases_the_workspace() {
        let (tx, rx) = oneshot::channel();
        let runtime = FakeRuntime::new().with_exit(rx);
        let seen = runtime.seen_workspaces.clone();
        let service = service_with(script_store(), runtime, 4, ResourceLimits::default());

        let id = service
            .execute(ExecutionRequest::new("scripts", "job.py"))
            .await
            .unwrap();
        tx.send(ExitInfo::with_code(1)).unwrap();
        let snap = wait_for_terminal(&service, id).await;
        assert_eq!(snap.state, ExecutionState::Failed);
        assert_workspace_removed(&seen).await;
    }

    #[tokio::test]
    async fn lost_exit_status_is_failed_with_the_explanatory_message() {
        let (tx, rx) = oneshot::channel();
        let runtime = FakeRuntime::new().with_exit(rx);
        let service = service_with(script_store(), runtime, 4, ResourceLimits::default());

        let id = service
            .execute(ExecutionRequest::new("scripts", "job.py"))
            .await
            .unwrap();
        // A wait that cannot attribute an exit code reports a message-only
        // ExitInfo, as the runtime does when the container is removed first.
        tx.send(ExitInfo::with_message(
            "exit status unavailable: container was removed before wait completed",
        ))
        .unwrap();

        let snap = wait_for_terminal(&service, id).await;
        assert_eq!(snap.state, ExecutionState::Failed);
        let exit = snap.exit_info.expect("terminal execution has exit info");
        assert_eq!(exit.exit_code, None);
        assert!(exit.message.unwrap().contains("exit status unavailable"));
    }

    #[tokio::test]
    async fn fetch_not_found_creates_no_workspace_and_no_record() {
        let runtime = FakeRuntime::new();
        let service = service_with(script_store(), runtime, 4, ResourceLimits::default());

        let err = service
            .execute(ExecutionRequest::new("scripts", "absent.py"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(service.registry.occupancy(), 0);
    }

    #[tokio::test]
    async fn second_execution_over_cap_is_rejected() {
        let (_tx, rx) = oneshot::channel();
        let runtime = FakeRuntime::new().with_exit(rx);
        let service = service_with(script_store(), runtime, 1, ResourceLimits::default());

        let first = service
            .execute(ExecutionRequest::new("scripts", "job.py"))
            .await
            .unwrap();
        assert_eq!(service.status(first).unwrap().state, ExecutionState::Running);

        let err = service
            .execute(ExecutionRequest::new("scripts", "job.py"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "capacity_exceeded");
    }

    #[tokio::test]
    async fn wall_timeout_terminates_and_reports_timed_out() {
        let limits = ResourceLimits {
            wall_timeout: Duration::from_millis(30),
            grace: Duration::from_millis(5),
            ..ResourceLimits::default()
        };
        // No exit channel: the run never finishes on its own.
        let runtime = FakeRuntime::new();
        let terminated = runtime.terminated.clone();
        let seen = runtime.seen_workspaces.clone();
        let service = service_with(script_store(), runtime, 4, limits);

        let id = service
            .execute(ExecutionRequest::new("scripts", "job.py"))
            .await
            .unwrap();
        let snap = wait_for_terminal(&service, id).await;
        assert_eq!(snap.state, ExecutionState::TimedOut);
        assert!(*terminated.lock().unwrap());
        assert_workspace_removed(&seen).await;
    }

    #[tokio::test]
    async fn cancellation_terminates_and_reports_cancelled() {
        let runtime = FakeRuntime::new();
        let terminated = runtime.terminated.clone();
        let service = service_with(script_store(), runtime, 4, ResourceLimits::default());

        let id = service
            .execute(ExecutionRequest::new("scripts", "job.py"))
            .await
            .unwrap();
        service.cancel(id).unwrap();

        let snap = wait_for_terminal(&service, id).await;
        assert_eq!(snap.state, ExecutionState::Cancelled);
        assert!(*terminated.lock().unwrap());

        // A second cancel is refused and exit info is untouched.
        let err = service.cancel(id).unwrap_err();
        assert_eq!(err.kind(), "already_terminal");
        assert_eq!(service.status(id).unwrap().exit_info, snap.exit_info);
    }

    #[tokio::test]
    async fn launch_failure_marks_the_record_failed() {
        let runtime = FakeRuntime {
            fail_launch: true,
            ..FakeRuntime::new()
        };
        let service = service_with(script_store(), runtime, 4, ResourceLimits::default());

        let err = service
            .execute(ExecutionRequest::new("scripts", "job.py"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "launch_error");
        assert_eq!(service.registry.occupancy(), 0);
    }

    #[tokio::test]
    async fn logs_stream_includes_runtime_output_and_ends_at_terminal() {
        let (tx, rx) = oneshot::channel();
        let runtime = FakeRuntime::new().with_exit(rx);
        let service = service_with(script_store(), runtime, 4, ResourceLimits::default());

        let id = service
            .execute(ExecutionRequest::new("scripts", "job.py"))
            .await
            .unwrap();
        tx.send(ExitInfo::with_code(0)).unwrap();
        wait_for_terminal(&service, id).await;

        let lines: Vec<String> = service.stream_logs(id).unwrap().collect().await;
        assert_eq!(lines, vec!["container started"]);
    }

    #[tokio::test]
    async fn logs_of_unknown_execution_are_not_found() {
        let runtime = FakeRuntime::new();
        let service = service_with(script_store(), runtime, 4, ResourceLimits::default());
        assert!(service.stream_logs(Uuid::new_v4()).is_err());
    }
}
