use dxcluster_backend::config::{self, DEFAULT_CONFIG_PATH};
use dxcluster_backend::module::scheduled::{ScheduledTaskConfig, ScheduledTaskManager};
use dxcluster_backend::service::DxClusterService;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = config::read_config(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    // Initialize logging
    let _logging_guard = dxcluster_backend::logging::init_logging(&config.log_dir, "dxcluster", &config.log_level)
        .context("Failed to initialize logging")?;

    tracing::info!("DX cluster backend starting...");
    if config_path.exists() {
        tracing::info!("Using config file {}", config_path.display());
    } else {
        tracing::warn!("Config file {} not found, running with defaults", config_path.display());
    }
    tracing::info!(
        "Cluster node {} as {}, cache size {}, enrichment {}",
        config.cluster.address(),
        config.cluster.callsign,
        config.cache.max_size,
        if config.enrichment.enabled { "enabled" } else { "disabled" }
    );

    let service = Arc::new(DxClusterService::new(config).context("Failed to create lookup client")?);
    service.start();

    let mut task_manager = ScheduledTaskManager::new(ScheduledTaskConfig::from(&config.maintenance), service.clone());
    task_manager.start_all();

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    task_manager.shutdown();
    service.shutdown().await;

    Ok(())
}
