//! Axum router construction.

use axum::{
    routing::{get, post},
    Router,
};
use common::protocol::routes;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
///
/// Handlers read the caller's address from `ConnectInfo<SocketAddr>`; serve
/// with [`common::serve::serve`] or attach `MockConnectInfo` in tests.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route(routes::ISSUE_JOIN_TICKET, post(handlers::issue_join_ticket))
        .route(
            routes::REQUEST_STATE_DISK_KEY,
            post(handlers::request_state_disk_key),
        )
        .route(routes::HEALTH, get(handlers::health))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .with_state(state)
}
