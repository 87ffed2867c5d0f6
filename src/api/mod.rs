//! The thin axum REST façade (§4.12/§6): one router, ten routes, no
//! business logic beyond the boundary validation §8 calls for.

pub mod dto;
pub mod handlers;

use crate::AppState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/search", get(handlers::search))
        .route("/detail", get(handlers::detail))
        .route("/toc", get(handlers::toc))
        .route("/download", get(handlers::download))
        .route("/download/start", post(handlers::download_start))
        .route("/download/progress", get(handlers::download_progress))
        .route("/download/result", get(handlers::download_result))
        .route("/sources", get(handlers::sources))
        .route("/health", get(handlers::health))
        .route("/cache/clear", post(handlers::cache_clear))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
