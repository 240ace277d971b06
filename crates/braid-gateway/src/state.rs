use std::sync::Arc;

use braid_agent::ChatRuntime;

/// Shared application state for axum handlers.
pub struct AppState {
    pub runtime: Arc<ChatRuntime>,
}
