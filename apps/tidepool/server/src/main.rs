use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tidepool_core::MediaEngineFactory;
use tidepool_server::{router, telemetry::Telemetry, AppState, Cli, ServerConfig};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        mode = config.mode.as_str(),
        delivery_timeout_ms = config.relay.delivery_timeout.as_millis() as u64,
        "starting tidepool server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let media_factory = if config.mode.serves_media() {
        Some(media_factory(&config)?)
    } else {
        None
    };
    let state = Arc::new(AppState::new(&config, media_factory, Some(metrics)));
    let sessions = state.shutdown_token();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("tidepool listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Upgraded sockets are not tracked by axum; tell them to close.
            sessions.cancel();
        })
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; waiting for sessions to close"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

#[cfg(feature = "webrtc-engine")]
fn media_factory(config: &ServerConfig) -> Result<Arc<dyn MediaEngineFactory>> {
    use tidepool_core::engine::rtc::{WebRtcEngineConfig, WebRtcEngineFactory};

    let factory = WebRtcEngineFactory::new(WebRtcEngineConfig {
        ice_servers: config.ice_servers.clone(),
        loopback_kinds: config.session.loopback_kinds.clone(),
        ..Default::default()
    })
    .context("failed to set up media engine")?;
    Ok(Arc::new(factory) as Arc<dyn MediaEngineFactory>)
}

#[cfg(not(feature = "webrtc-engine"))]
fn media_factory(_config: &ServerConfig) -> Result<Arc<dyn MediaEngineFactory>> {
    anyhow::bail!("media mode needs the `webrtc-engine` feature; run with --mode relay")
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
