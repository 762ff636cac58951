//! Shared application state injected into every handler.

use std::sync::Arc;

use easel_core::{BridgeOptions, Orchestrator};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Settings for streamed generations.
    pub bridge: BridgeOptions,
    /// Allowed CORS origins; empty allows any.
    pub cors_origins: Vec<String>,
}
