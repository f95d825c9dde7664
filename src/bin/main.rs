use channel_relay::config::load_config;
use channel_relay::create_app;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("channel_relay=info")),
        )
        .init();

    let config = load_config();
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let (state, app) = create_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let lost = state.retry.abandon().await;
    if lost > 0 {
        warn!(lost, "shut down with undelivered retries");
    }
    info!("channel relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
