//! Standalone worker + reaper process.
//!
//! Shares tasks with the API only through Postgres and Redis; with either
//! one unset it processes its own in-memory backends, which is useful only
//! for local smoke runs.

use anyhow::Context;

use docflow_api::app::services;
use docflow_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docflow_observability::init();

    let config = AppConfig::from_env()?;
    if config.database_url.is_none() || config.redis_url.is_none() {
        tracing::warn!("DATABASE_URL or REDIS_URL not set; this worker will not see API tasks");
    }

    let services = services::build_services(&config).await?;
    let analyzer = services::build_analyzer(&config)?;
    let background = services::spawn_background(&config, &services, analyzer)?;
    tracing::info!(worker = %config.worker.name, reaper = %config.reaper.name, "worker process started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutdown requested; waiting for the current task");
    tokio::task::spawn_blocking(move || background.shutdown()).await?;
    Ok(())
}
