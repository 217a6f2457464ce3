//! HTTP API for the Scribe service.
//!
//! - Health and metrics monitoring
//! - Document upload
//! - Search

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Role;
use crate::search::SearchService;
use crate::service::DocumentService;

pub mod documents;
pub mod search;
use documents::upload_document_handler;
use search::search_handler;

/// Application state
pub struct AppState {
    pub documents: Arc<DocumentService>,
    pub search: Arc<SearchService>,
    pub metrics: PrometheusHandle,
    pub role: Role,
    pub start_time: Instant,
}

/// Build the API router
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let state = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/documents",
            post(upload_document_handler).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/search", get(search_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        role: state.role.as_str(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    role: &'static str,
    uptime_seconds: u64,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
