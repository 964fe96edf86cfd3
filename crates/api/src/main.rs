use anyhow::Context;
use tracing::info;

use cabinet_api::app::{build_app, services};
use cabinet_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cabinet_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let wiring = services::build_services(&config).await?;
    let (services, background) = wiring.start();

    let app = build_app(services);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    background.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
