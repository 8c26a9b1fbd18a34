//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::{MapCatalog, SessionRegistry};
use crate::store::achievement_sink;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: Config, maps: MapCatalog) -> Self {
        let config = Arc::new(config);

        // Outbound achievement unlocks (logging stand-in without an endpoint)
        let achievements = achievement_sink(&config);

        // Every live session, driven by one shared timer
        let registry = Arc::new(SessionRegistry::new(Arc::new(maps), achievements));

        Self { config, registry }
    }
}
