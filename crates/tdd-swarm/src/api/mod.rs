//! HTTP API over the classifier, residency manager and role executors.

pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/executors", get(routes::executors))
        .route("/models", get(routes::executors))
        .route("/memory", get(routes::memory))
        .route("/route", post(routes::route))
        .route("/architect", post(routes::architect))
        .route("/coder", post(routes::coder))
        .route("/reviewer", post(routes::reviewer))
        .route("/escalate", post(routes::escalate))
        .route("/batch", post(routes::batch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
