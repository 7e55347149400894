//! Application state shared across handlers.

use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    /// Origins allowed by the CORS layer.
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(sessions: SessionRegistry) -> Self {
        Self {
            sessions,
            cors_origins: Vec::new(),
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }
}
