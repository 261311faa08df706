use std::sync::Arc;

use crate::db::store::TaskStore;
use crate::services::broker::Broker;
use crate::services::storage::ObjectStore;

/// Shared application state passed to all route handlers.
///
/// Handles are created once at process init and injected; adapters are held
/// behind their capability traits so tests can substitute in-memory fakes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub blobs: Arc<dyn ObjectStore>,
    pub broker: Arc<dyn Broker>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TaskStore>,
        blobs: Arc<dyn ObjectStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            store,
            blobs,
            broker,
        }
    }
}
