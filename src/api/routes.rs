//! API route definitions.

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use super::ws;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .route("/", get(handlers::status))
        .route("/connect", get(handlers::discovered).post(handlers::connect))
        .route("/disconnect", get(handlers::disconnect))
        .route("/discovered", get(handlers::discovered))
        .route("/watcher/{name}/pids", get(handlers::watcher_pids))
        .route("/sockets", get(handlers::sockets))
        .route("/globaloptions", get(handlers::global_options))
        // Command routes carry the daemon endpoint as a base64 token so it
        // can live in a single path segment.
        .route("/{endpoint}/add_watcher", post(handlers::add_watcher))
        .route(
            "/{endpoint}/watcher/{name}/switch_status",
            get(handlers::switch_status),
        )
        .route(
            "/{endpoint}/watcher/{name}/process/incr",
            get(handlers::incr_proc),
        )
        .route(
            "/{endpoint}/watcher/{name}/process/decr",
            get(handlers::decr_proc),
        )
        .route(
            "/{endpoint}/watcher/{name}/process/kill/{pid}",
            get(handlers::kill_process),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(trace_layer)
        .with_state(state)
}
