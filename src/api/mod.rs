//! HTTP surface for clients: start operations and poll their results.

pub mod routes;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::context::NodeContext;

pub type SharedState = Arc<NodeContext>;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/info", get(routes::info))
        // Operations
        .route("/publish", post(routes::publish))
        .route("/update", post(routes::update))
        .route("/local-store", post(routes::local_store))
        .route("/get", post(routes::get))
        .route("/ask", post(routes::ask))
        .route("/operations/:kind/:operation_id", get(routes::operation_result))
        // Finality
        .route("/finality", get(routes::finality))
        // Health check
        .route("/health", get(routes::health))
        .with_state(state)
}
