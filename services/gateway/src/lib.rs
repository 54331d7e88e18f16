pub mod chunker;
pub mod commands;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod platform;
pub mod registry;
pub mod responses;
pub mod state;
pub mod stream;
pub mod timer;

pub use state::AppState;

use axum::{
    Router,
    routing::get,
};
use tower_http::trace::TraceLayer;

/// The adapter's HTTP surface: one path, two verbs.
///
/// `GET /connect` opens the SSE stream, `POST /connect` carries commands.
/// Callers mount the returned router under their adapter prefix.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/connect",
            get(stream::sse_connect).post(commands::command_endpoint),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
