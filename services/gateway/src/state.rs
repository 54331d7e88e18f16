use crate::config::{SharedConfig, SseConfig};
use crate::dispatch::Dispatcher;
use crate::platform::InboundSink;
use crate::registry::ClientRegistry;
use std::sync::Arc;

/// Everything the HTTP surface needs, passed at construction — no
/// process-global registries.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub config: SharedConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub ingest: Arc<dyn InboundSink>,
}

impl AppState {
    pub fn new(config: SseConfig, ingest: Arc<dyn InboundSink>) -> Self {
        let registry = ClientRegistry::new();
        let config = crate::config::shared(config);
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&config));
        Self {
            registry,
            config,
            dispatcher,
            ingest,
        }
    }
}
