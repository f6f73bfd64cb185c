//! API layer - routes, handlers, and middleware

pub mod bundle;
pub mod extractors;
pub mod handlers;
pub mod headers;
pub mod middleware;
pub mod routes;
pub mod url;

use crate::state::AppState;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let max_body_size = state.config.server.max_request_body_size;
    let cors_origins = state.config.server.cors_origins.clone();

    Router::new()
        .route("/health", get(health_check))
        .merge(routes::metrics::metrics_routes())
        .nest("/fhir", routes::fhir::fhir_routes())
        .with_state(state)
        // Applied in reverse order: the body limit sees the request first.
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::metrics_middleware))
        .layer(middleware::cors(&cors_origins))
        .layer(DefaultBodyLimit::max(max_body_size))
}

/// Liveness plus the job queue's own health report.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let backend = format!("{:?}", state.config.store.backend).to_lowercase();
    match state.job_queue.health_check().await {
        Ok(queue) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "fhir-server",
                "store": backend,
                "remoteIndexing": state.persistence.is_remote_indexing(),
                "jobQueue": queue
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "service": "fhir-server",
                    "store": backend
                })),
            )
        }
    }
}
