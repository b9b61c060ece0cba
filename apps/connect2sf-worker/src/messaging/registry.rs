use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::handler::EventHandler;

/// Routing key to handler mapping.
///
/// Built once at startup and shared read-only behind an `Arc`. `register`
/// swaps the whole mapping, so a reader never observes a half-updated set.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        mut self,
        routing_key: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Self {
        self.handlers.insert(routing_key.into(), Arc::new(handler));
        self
    }

    pub fn register(&mut self, handlers: HashMap<String, Arc<dyn EventHandler>>) {
        info!(handlers = handlers.len(), "Replacing event handler registry");
        self.handlers = handlers;
    }

    pub fn resolve(&self, routing_key: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(routing_key).cloned()
    }

    /// Keys the queue gets bound to, sorted for stable topology setup.
    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routing_keys", &self.routing_keys())
            .finish()
    }
}
