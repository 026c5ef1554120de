mod call;
mod candidates;
mod cli;
mod config;
mod media;
mod pipeline;
mod registry;
mod signaling;
mod telemetry;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    call::CallCoordinator,
    cli::{Cli, Commands},
    config::ServerConfig,
    media::{MediaServer, UriConnector},
    pipeline::MediaOrchestrator,
    telemetry::Telemetry,
    websocket::{websocket_handler, SignalingState},
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        name,
        decline,
        listen_secs,
    }) = cli.command
    {
        return cli::run_probe(url, name, decline, listen_secs).await;
    }

    let config = ServerConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        media_server_uri = %config.media_server_uri,
        recordings_uri = %config.recordings_uri,
        provision_timeout_secs = config.provision_timeout.as_secs(),
        "starting beach-call signaling server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let media_server = Arc::new(MediaServer::new(
        config.media_server_uri.clone(),
        Arc::new(UriConnector {
            request_timeout: config.media_request_timeout,
        }),
    ));
    info!(uri = media_server.uri(), "media server connection deferred until the first call");
    let orchestrator = MediaOrchestrator::new(
        media_server,
        config.recordings_uri.clone(),
        config.provision_timeout,
    );
    let (coordinator, coordinator_task) = CallCoordinator::spawn(orchestrator);

    let http_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let ws_routes = Router::new()
        .route("/one2one", get(websocket_handler))
        .with_state(SignalingState::new(coordinator));

    let app = Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("beach-call listening on {}", config.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; releasing active calls"
    );
    match tokio::time::timeout(config.shutdown_grace, coordinator_task).await {
        Ok(Ok(())) => info!("graceful shutdown complete"),
        Ok(Err(err)) => warn!(error = %err, "call coordinator task failed"),
        Err(_) => warn!("active calls were not released within the grace period"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(metrics): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}
