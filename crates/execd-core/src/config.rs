//! Service configuration loaded from YAML
//!
//! Every field has a serde default so a minimal config (just a storage
//! endpoint) is enough to start the service, and operators add bounds and
//! overrides as needed. Credentials can be supplied through the environment
//! instead of the file: `EXECD_STORAGE_ACCESS_KEY` / `EXECD_STORAGE_SECRET_KEY`
//! take precedence over whatever the YAML says.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::errors::{ExecError, Result};
use crate::types::{NetworkMode, ResourceLimits};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecdConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Object-storage endpoint the fetcher reads from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Base URL of an S3-compatible endpoint, e.g. "https://play.min.io"
    pub endpoint: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "default_storage_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Container runtime connection and image selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker daemon address; None uses the platform-local defaults
    #[serde(default)]
    pub docker_host: Option<String>,
    #[serde(default = "default_image")]
    pub image: String,
    /// Interpreter argv prefix; the staged script path is appended
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            image: default_image(),
            interpreter: default_interpreter(),
        }
    }
}

/// Per-execution resource bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: i64,
    #[serde(default = "default_memory_cap")]
    pub memory_cap_bytes: i64,
    #[serde(default = "default_wall_timeout_secs")]
    pub wall_timeout_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default)]
    pub network_mode: NetworkMode,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu_shares: default_cpu_shares(),
            memory_cap_bytes: default_memory_cap(),
            wall_timeout_secs: default_wall_timeout_secs(),
            grace_secs: default_grace_secs(),
            network_mode: NetworkMode::default(),
        }
    }
}

impl LimitsConfig {
    pub fn to_resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_shares: self.cpu_shares,
            memory_cap: self.memory_cap_bytes,
            wall_timeout: Duration::from_secs(self.wall_timeout_secs),
            grace: Duration::from_secs(self.grace_secs),
            network_mode: self.network_mode,
        }
    }
}

/// Registry behavior: admission cap and terminal-record retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: usize,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: default_concurrency_cap(),
            retention_secs: default_retention_secs(),
        }
    }
}

/// HTTP front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    #[serde(default)]
    pub cors_origins: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            enable_cors: true,
            cors_origins: None,
        }
    }
}

fn default_storage_timeout_secs() -> u64 {
    30
}

fn default_image() -> String {
    "python:3.8-slim".to_string()
}

fn default_interpreter() -> Vec<String> {
    vec!["python".to_string()]
}

fn default_cpu_shares() -> i64 {
    512
}

fn default_memory_cap() -> i64 {
    256 * 1024 * 1024
}

fn default_wall_timeout_secs() -> u64 {
    300
}

fn default_grace_secs() -> u64 {
    5
}

fn default_concurrency_cap() -> usize {
    4
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_true() -> bool {
    true
}

impl ExecdConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ExecError::internal(format!(
                "failed to read configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string and apply environment overrides.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: ExecdConfig = serde_yaml::from_str(content)
            .map_err(|e| ExecError::internal(format!("invalid configuration: {}", e)))?;
        config.resolve_environment();
        config.validate()?;
        Ok(config)
    }

    fn resolve_environment(&mut self) {
        if let Ok(key) = env::var("EXECD_STORAGE_ACCESS_KEY") {
            self.storage.access_key = Some(key);
        }
        if let Ok(key) = env::var("EXECD_STORAGE_SECRET_KEY") {
            self.storage.secret_key = Some(key);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.storage.endpoint.is_empty() {
            return Err(ExecError::internal(
                "configuration is missing storage.endpoint",
            ));
        }
        if self.service.concurrency_cap == 0 {
            return Err(ExecError::internal(
                "service.concurrency_cap must be at least 1",
            ));
        }
        if self.limits.wall_timeout_secs == 0 {
            return Err(ExecError::internal("limits.wall_timeout_secs must be nonzero"));
        }
        Ok(())
    }
}
