use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rooper_cloud::publisher::ResultPublisher;
use rooper_cloud::storage::S3ObjectStore;
use rooper_comfyui::api::ComfyUIApi;
use rooper_core::assets::Aria2Downloader;
use rooper_worker::config::WorkerConfig;
use rooper_worker::handler::JobHandler;
use rooper_worker::server::{self, AppState};
use rooper_worker::warmup;

const DEFAULT_LOG_FILTER: &str =
    "rooper_worker=info,rooper_comfyui=info,rooper_cloud=info,rooper_core=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    // --- Configuration ---
    let config = Arc::new(WorkerConfig::from_env().context("Invalid worker configuration")?);
    tracing::info!(
        host = %config.host,
        port = config.port,
        comfyui_url = %config.comfyui_url,
        template = %config.workflow_template.display(),
        "Loaded worker configuration",
    );

    // --- Assets ---
    warmup::provision_assets(&config, &Aria2Downloader::default()).await;

    // --- Collaborators ---
    let api = ComfyUIApi::new(config.comfyui_url.clone());
    let store = Arc::new(S3ObjectStore::connect(&config.storage).await);
    let publisher = ResultPublisher::new(
        store,
        config.addressing.clone(),
        config.upload_retry.clone(),
    );
    let handler = Arc::new(JobHandler::new(Arc::clone(&config), api, publisher));

    let shutdown = CancellationToken::new();
    let app = server::router(AppState {
        handler,
        shutdown: shutdown.clone(),
    });

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().context("Invalid HOST address")?,
        config.port,
    );
    tracing::info!(%addr, "Starting worker");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Abandon the in-flight job so the drain does not wait on it.
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
