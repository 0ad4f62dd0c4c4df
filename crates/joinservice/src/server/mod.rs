//! Axum HTTP server for the join service.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
