//! HTTP server setup and routing.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{config::Config, index, resolver, state::AppState, transload, upload, upstream::UpstreamClient};

/// Wire every handler onto a router sharing `state`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/simple", get(|| async { axum::response::Redirect::permanent("/simple/") }))
        .route("/simple/", get(index::simple_index))
        .route(
            "/simple/{name}/",
            get(resolver::package_listing).post(resolver::reload_listing),
        )
        .route(
            "/simple/{name}",
            get(resolver::listing_redirect).post(resolver::reload_listing),
        )
        .route("/package/cache/{*path}", get(index::serve_cached))
        .route("/package/remote/{*path}", get(transload::transload))
        .route("/pypi", post(upload::upload_package))
        .route("/pypi/", post(upload::upload_package))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal, stopping server gracefully");
}

/// Create the storage roots and serve until interrupted.
pub async fn run_server(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.package.cache_dir)?;
    std::fs::create_dir_all(&config.package.upload_dir)?;

    info!(
        cache_dir = %config.package.cache_dir.display(),
        upload_dir = %config.package.upload_dir.display(),
        index = %config.index.base,
        "Using storage directories"
    );

    let host = config.server.host.clone();
    let port = config.server.port;
    let fetcher = Arc::new(UpstreamClient::new()?);
    let state = Arc::new(AppState::new(config, fetcher));
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse().map_err(|e| {
        error!(host = %host, port = %port, error = %e, "Invalid socket address");
        anyhow::anyhow!("Invalid socket address {}:{}: {}", host, port, e)
    })?;

    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "Failed to bind to address");
        anyhow::anyhow!("Failed to bind to {}:{}: {}", host, port, e)
    })?;

    info!("Server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error = %e, "Server error");
            anyhow::anyhow!("Server error: {}", e)
        })?;

    Ok(())
}
