//! HTTP/WebSocket boundary.
//!
//! Thin by design: JSON data endpoints, redirect-style command endpoints and
//! the stats WebSocket. No HTML is rendered here.

mod commands;
mod error;
mod handlers;
mod routes;
mod state;
mod ws;

pub use commands::{CommandArgs, CommandRegistry, run_command};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
