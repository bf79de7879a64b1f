//! Web server module for inbound tracking callbacks and landing pages.
//!
//! Routes:
//! - `GET|POST /track/:kind` records an engagement event
//! - `GET /landing/:page_id` serves a campaign's landing page
//! - `GET /health`

pub mod handlers;

use axum::{
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    health, landing, track_get, track_post, AppState, HealthResponse, LandingQuery, PIXEL_GIF,
};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/track/:kind", get(track_get).post(track_post))
        .route("/landing/:page_id", get(landing))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
