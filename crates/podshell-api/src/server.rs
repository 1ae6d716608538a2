//! HTTP server

use std::path::Path;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use kube::Client;
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use podshell_exec::{ExecGate, ExecutorKind, TerminalExec};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handlers::exec_handler;

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Pre-flight eligibility check
    pub gate: ExecGate,
    /// Session driver
    pub exec: TerminalExec,
    /// Executor used when a request names none
    pub default_executor: Option<ExecutorKind>,
}

/// Build the router
///
/// The handshake timeout only bounds the upgrade request; the session itself
/// runs on its own task once upgraded.
pub fn router(state: AppState, handshake_timeout: Duration, frontend: Option<&Path>) -> Router {
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/exec",
            get(exec_handler).layer(TimeoutLayer::new(handshake_timeout)),
        )
        .with_state(state);

    let app = match frontend {
        Some(dir) => {
            let serve_dir = ServeDir::new(dir)
                .append_index_html_on_directories(true)
                .fallback(ServeFile::new(dir.join("index.html")));
            app.fallback_service(serve_dir)
        }
        None => app,
    };

    app.layer(TraceLayer::new_for_http())
}

/// Connect to the cluster and serve until interrupted
pub async fn run(config: ServerConfig) -> Result<()> {
    let kube_config = config.kube_config().await?;
    let cluster_url = kube_config.cluster_url.clone();

    let client = Client::try_from(kube_config.clone())
        .map_err(|e| Error::Config(format!("failed to create kube client: {}", e)))?;
    let state = AppState {
        gate: ExecGate::for_client(client.clone()),
        exec: TerminalExec::new(client, &kube_config)?,
        default_executor: config.default_executor,
    };

    let app = router(state, config.handshake_timeout(), config.frontend.as_deref());

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {}: {}", config.listen, e)))?;

    info!(addr = %config.listen, cluster = %cluster_url, "podshell listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(format!("server error: {}", e)))?;

    info!("podshell stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
