//! FaceID Server - REST API for face enrollment and verification
//!
//! Exposes the faceid-core identity pipeline via HTTP endpoints:
//! - POST /enroll - Bind a face to an identity label
//! - POST /verify - Find the enrolled identity matching a face
//! - POST /extract - Extract a fingerprint without touching the store
//! - GET /identities, DELETE /identities/{label} - Manage enrolled identities

use std::net::SocketAddr;

use faceid_server::{create_router_with_config, AppState, Config};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "faceid_server=info,faceid_core=info,tower_http=info";

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let fmt_layer = fmt::layer().with_target(true).with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(fmt_layer);
    if tracing::subscriber::set_global_default(registry).is_err() {
        // Already initialised.
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::from_env()?;
    info!(
        analyzer = ?config.face_analyzer,
        store = ?config.store_backend,
        threshold = config.similarity_threshold,
        max_concurrent_inference = config.max_concurrent_inference,
        "Starting faceid-server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = AppState::from_config(&config).await?;
    let pipeline = state.pipeline.clone();
    let app = create_router_with_config(state, &config);

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening (docs at /docs)");

    // Peer addresses feed the rate limiter's key extractor
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    pipeline.store().disconnect().await;
    info!("Server stopped");
    Ok(())
}
