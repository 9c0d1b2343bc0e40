use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use axum::{
    Json, Router,
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct AppState {
    pub cargo_pkg_name: &'static str,
    pub cargo_pkg_version: &'static str,
    /// Set by the controller once the watch caches are synced.
    pub ready: Arc<AtomicBool>,
}

pub fn app(state: AppState) -> Router {
    let tracer_layer = TraceLayer::new_for_http();

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .fallback(not_found_handler)
        .with_state(state)
        .layer(tracer_layer)
}

#[instrument(name = "health_handler", skip_all)]
async fn health_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    debug!(%addr, "client connected");
    Json(json!({
        "service": state.cargo_pkg_name,
        "version": state.cargo_pkg_version,
        "status": "healthy"
    }))
}

#[instrument(name = "ready_handler", skip_all)]
async fn ready_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    debug!(%addr, "client connected");
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "syncing" })),
        )
    }
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "nothing to see here")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn serve(ready: Arc<AtomicBool>) -> SocketAddr {
        let state = AppState {
            cargo_pkg_name: "builder-controller",
            cargo_pkg_version: "0.1.0",
            ready,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(
                listener,
                app(state).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn health_reports_service_identity() {
        let addr = serve(Arc::new(AtomicBool::new(false))).await;

        let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["service"], "builder-controller");
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn ready_follows_cache_sync() {
        let ready = Arc::new(AtomicBool::new(false));
        let addr = serve(Arc::clone(&ready)).await;

        let response = reqwest::get(format!("http://{addr}/ready")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::SeqCst);
        let response = reqwest::get(format!("http://{addr}/ready")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let addr = serve(Arc::new(AtomicBool::new(true))).await;

        let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
