//! Authoritative session server for Phaser devices.
//!
//! Devices connect over `/ws`, register, heartbeat, and submit hit reports
//! for arbitration. Operators read status and push rule changes over the
//! bearer-protected `/api/v1` REST surface.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod session;
pub mod state;
pub mod ws;

use std::time::Duration;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use config::ServerConfig;
use state::AppState;

/// Build the Axum router and application state from a config.
pub fn build_app(config: ServerConfig) -> (Router<()>, AppState) {
    let state = AppState::new(config);

    let api_routes = Router::new()
        .route("/status", get(api::get_status))
        .route("/config", get(api::get_config).put(api::put_config))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_layer,
        ))
        .layer(CorsLayer::permissive());

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_check))
        .nest("/api/v1", api_routes)
        .with_state(state.clone());

    (app, state)
}

/// Periodically drop devices that stopped talking.
pub fn spawn_stale_cleanup(state: AppState) -> JoinHandle<()> {
    let max_age = Duration::from_secs(state.config.sessions.stale_timeout_secs);
    let period = Duration::from_secs(state.config.sessions.cleanup_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let removed = state.sessions.write().await.cleanup_stale(max_age);
            if !removed.is_empty() {
                tracing::info!(count = removed.len(), "Stale device cleanup");
            }
        }
    })
}

/// Serve on `listener` until the process ends.
pub async fn serve(listener: TcpListener, config: ServerConfig) -> std::io::Result<()> {
    let (app, state) = build_app(config);
    let cleanup = spawn_stale_cleanup(state);
    let result = axum::serve(listener, app).await;
    cleanup.abort();
    result
}

/// Middleware wrapper that injects AuthConfig into request extensions for the
/// bearer auth middleware.
async fn bearer_auth_layer(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut request: axum::extract::Request,
    next: middleware::Next,
) -> Result<axum::response::Response, axum::http::StatusCode> {
    request.extensions_mut().insert(state.auth.clone());
    auth::bearer_auth_middleware(request.headers().clone(), request, next).await
}
