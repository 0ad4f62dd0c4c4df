//! Axum HTTP server exposing the data-key API.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
