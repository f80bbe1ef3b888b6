//! execd binary: configuration, wiring, and the serve loop
//!
//! Loads the YAML configuration, connects the storage and container-runtime
//! clients, and hands a fully wired `ExecutionService` to the HTTP server.
//! Clients are constructed here and injected; nothing in the library reaches
//! for process-wide singletons.

use anyhow::{Context, Result};
use clap::Parser;
use execd_core::{
    DockerRuntime, ExecdConfig, ExecutionRegistry, ExecutionService, HttpObjectStore, StagingArea,
};
use execd_server::{shutdown_signal, ExecServer, ServerConfig};
use log::LevelFilter;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "execd - run scripts from object storage in containers")]
struct Cli {
    #[clap(long, short, default_value = "execd.yaml", help = "Path to the YAML configuration file")]
    config: String,

    #[clap(long, help = "Bind address, overriding the configuration file")]
    bind_addr: Option<String>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = ExecdConfig::from_file(&cli.config)
        .await
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    let store = HttpObjectStore::new(&config.storage).context("building storage client")?;
    let runtime =
        DockerRuntime::new(&config.runtime).context("connecting to the container runtime")?;

    let registry = Arc::new(ExecutionRegistry::new(
        config.service.concurrency_cap,
        Duration::from_secs(config.service.retention_secs),
    ));
    // Sweep at a fraction of the retention window; once a minute at most.
    let sweep_interval = Duration::from_secs((config.service.retention_secs / 4).clamp(1, 60));
    Arc::clone(&registry).spawn_retention_sweep(sweep_interval);

    let service = Arc::new(ExecutionService::new(
        Arc::new(store),
        Arc::new(runtime),
        registry,
        StagingArea::new(),
        config.limits.to_resource_limits(),
    ));

    let bind_addr = cli.bind_addr.unwrap_or_else(|| config.server.bind_addr.clone());
    let mut server_config = ServerConfig::new()
        .with_bind_addr_str(&bind_addr)
        .context("parsing bind address")?
        .with_cors(config.server.enable_cors);
    if let Some(origins) = config.server.cors_origins.clone() {
        server_config = server_config.with_cors_origins(origins);
    }

    log::info!(
        "starting execd: cap={}, image={}, storage={}",
        config.service.concurrency_cap,
        config.runtime.image,
        config.storage.endpoint
    );

    ExecServer::with_config(service, server_config)
        .serve_with_shutdown(shutdown_signal())
        .await
        .context("running the execd server")?;

    Ok(())
}
