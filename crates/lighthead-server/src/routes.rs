//! Router configuration

use axum::{middleware::from_fn, middleware::from_fn_with_state, routing::get, Router};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::middleware::{access_log, require_api_key};
use super::AppState;

/// Create the router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/scrape",
            get(handlers::scrape)
                .route_layer(from_fn_with_state(state.clone(), require_api_key)),
        )
        .layer(from_fn(access_log))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
