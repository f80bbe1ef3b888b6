//! Docker-backed execution launcher
//!
//! Each execution gets a container named `exec-{execution_id}`; ids are
//! UUIDv4, so names never collide with live or recently removed containers.
//! The workspace is bind-mounted read-write at /app, resource limits go
//! through HostConfig, and `auto_remove` makes the daemon delete the
//! container on exit regardless of exit code.

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptions, KillContainerOptions, LogsOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::time::Duration;

use super::{LaunchSpec, RunningScript, ScriptRuntime};
use crate::config::RuntimeConfig;
use crate::errors::{ExecError, Result};
use crate::relay::LogSink;
use crate::types::ExitInfo;

/// Working directory inside the container; the workspace is mounted here.
const CONTAINER_WORK_DIR: &str = "/app";

pub struct DockerRuntime {
    docker: Docker,
    image: String,
    interpreter: Vec<String>,
}

impl DockerRuntime {
    /// Connect to the Docker daemon named in the config, or the platform
    /// defaults when no address is given.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let docker = match &config.docker_host {
            Some(host) => Docker::connect_with_http(host, 30, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| ExecError::launch(format!("container runtime unavailable: {}", e)))?;
        Ok(Self {
            docker,
            image: config.image.clone(),
            interpreter: config.interpreter.clone(),
        })
    }

    fn command_for(&self, script_name: &str) -> Vec<String> {
        let mut cmd = self.interpreter.clone();
        cmd.push(format!("{}/{}", CONTAINER_WORK_DIR, script_name));
        cmd
    }
}

#[async_trait]
impl ScriptRuntime for DockerRuntime {
    async fn launch(&self, spec: LaunchSpec<'_>) -> Result<Box<dyn RunningScript>> {
        let container_name = format!("exec-{}", spec.execution_id);
        let host_root = spec
            .workspace
            .root()
            .to_str()
            .ok_or_else(|| ExecError::staging("workspace path is not valid UTF-8"))?
            .to_string();

        let options = Some(CreateContainerOptions {
            name: Some(container_name.clone()),
            ..Default::default()
        });

        let config = ContainerCreateBody {
            image: Some(self.image.clone()),
            cmd: Some(self.command_for(spec.workspace.script_name())),
            working_dir: Some(CONTAINER_WORK_DIR.to_string()),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![format!("{}:{}", host_root, CONTAINER_WORK_DIR)]),
                memory: Some(spec.limits.memory_cap),
                cpu_shares: Some(spec.limits.cpu_shares),
                network_mode: Some(spec.limits.network_mode.as_docker_mode().to_string()),
                auto_remove: Some(true),
                ..Default::default()
            }),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| ExecError::launch(format!("container create failed: {}", e)))?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| ExecError::launch(format!("container start failed: {}", e)))?;

        log::info!(
            "started container {} for execution {}",
            container_name,
            spec.execution_id
        );

        spawn_log_pump(self.docker.clone(), container.id.clone(), spec.logs.clone());

        Ok(Box::new(RunningContainer {
            docker: self.docker.clone(),
            container_id: container.id,
        }))
    }
}

/// Follow the container's output and push lines into the sink.
///
/// Runs until the log stream ends, which happens when the container exits;
/// the supervisor closes the buffer afterwards.
fn spawn_log_pump(docker: Docker, container_id: String, sink: LogSink) {
    tokio::spawn(async move {
        let mut output = docker.logs(
            &container_id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            }),
        );
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    for line in String::from_utf8_lossy(&message).lines() {
                        sink.push(line);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::debug!("log stream for container {} ended: {}", container_id, e);
                    break;
                }
            }
        }
    });
}

/// Docker's stop timeout is an i32 of seconds; oversized grace values clamp
/// instead of wrapping negative.
fn stop_timeout_secs(grace: Duration) -> i32 {
    i32::try_from(grace.as_secs()).unwrap_or(i32::MAX)
}

struct RunningContainer {
    docker: Docker,
    container_id: String,
}

#[async_trait]
impl RunningScript for RunningContainer {
    async fn wait(&mut self) -> Result<ExitInfo> {
        let mut wait_stream = self
            .docker
            .wait_container(&self.container_id, None::<WaitContainerOptions>);
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(ExitInfo::with_code(response.status_code)),
            // With auto_remove the daemon may tear the container down before
            // the wait response arrives, and the exit code is lost with it.
            // Report the ambiguity explicitly: exit_code stays None and the
            // message says the status was lost, so callers can tell this
            // apart from a run that genuinely exited nonzero.
            Some(Err(e)) => {
                log::debug!("wait on container {} returned: {}", self.container_id, e);
                Ok(ExitInfo::with_message(
                    "exit status unavailable: container was removed before wait completed",
                ))
            }
            None => Err(ExecError::internal(
                "container wait stream ended unexpectedly",
            )),
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        log::info!(
            "terminating container {} with {}s grace",
            self.container_id,
            grace.as_secs()
        );
        let stop = self
            .docker
            .stop_container(
                &self.container_id,
                Some(StopContainerOptions {
                    t: Some(stop_timeout_secs(grace)),
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = stop {
            // Already-gone containers are fine; anything else gets one kill.
            log::debug!("stop of container {} failed: {}", self.container_id, e);
            let _ = self
                .docker
                .kill_container(&self.container_id, None::<KillContainerOptions>)
                .await;
        }
        Ok(())
    }
}
