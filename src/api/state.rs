//! Shared application state.
//!
//! Everything the original kept in module-level globals is constructed once
//! at startup and injected here.

use std::sync::Arc;

use crate::controller::Controller;
use crate::discovery::DiscoveryService;
use crate::session::SessionManager;
use crate::stats::StatsHub;

use super::commands::CommandRegistry;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub hub: Arc<StatsHub>,
    pub discovery: Arc<DiscoveryService>,
    pub sessions: Arc<SessionManager>,
    pub commands: Arc<CommandRegistry>,
}

impl AppState {
    pub fn new(
        controller: Arc<Controller>,
        hub: Arc<StatsHub>,
        discovery: Arc<DiscoveryService>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            controller,
            hub,
            discovery,
            sessions,
            commands: Arc::new(CommandRegistry::new()),
        }
    }
}
