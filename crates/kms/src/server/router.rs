//! Axum router construction.

use axum::{
    routing::{get, post},
    Router,
};
use common::protocol::routes;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route(routes::GET_DATA_KEY, post(handlers::get_data_key))
        .route(routes::HEALTH, get(handlers::health))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .with_state(state)
}
