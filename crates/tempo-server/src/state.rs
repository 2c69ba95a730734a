use std::sync::Arc;

use tempo_core::gateway::ScrapeApi;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub gateway: Arc<dyn ScrapeApi>,
}
