use std::sync::Arc;

use anyhow::Context;

use docflow_api::app::{build_app, services};
use docflow_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docflow_observability::init();

    let config = AppConfig::from_env()?;
    let services = Arc::new(services::build_services(&config).await?);

    let background = if config.embedded_worker {
        let analyzer = services::build_analyzer(&config)?;
        Some(services::spawn_background(&config, &services, analyzer)?)
    } else {
        tracing::info!("EMBEDDED_WORKER=false; run docflow-worker to process tasks");
        None
    };

    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(background) = background {
        tracing::info!("stopping worker and reaper");
        tokio::task::spawn_blocking(move || background.shutdown()).await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
}
