use lib_observatory::{Registry, SubscriptionStore};
use std::sync::Arc;

/// Handles shared by every API request.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn SubscriptionStore>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>) -> Self {
        // The registry writes bookkeeping to the same store the API reads.
        let store = Arc::clone(registry.store());
        Self { registry, store }
    }
}
