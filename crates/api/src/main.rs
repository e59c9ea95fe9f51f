use std::sync::Arc;

use anyhow::Context;

use assay_api::app::{self, services};
use assay_infra::AssayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    assay_observability::init();

    let config = AssayConfig::from_env().context("invalid configuration")?;
    let backends = services::Backends::from_config(&config).await?;

    let pool = backends
        .worker_pool(services::http_analyzers(&config), &config)
        .spawn();
    let sweeper = backends.sweeper(&config).spawn();
    let janitor = backends.cache.spawn_cleanup(config.cache_cleanup_interval);

    let app = app::build_app(Arc::new(services::AppServices::new(&backends, &config)));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down background tasks");
    pool.shutdown().await;
    sweeper.shutdown().await;
    janitor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
