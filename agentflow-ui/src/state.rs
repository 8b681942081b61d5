//! Shared application state for the HTTP server.

use std::sync::Arc;

use agentflow::io::capability::CapabilityProvider;
use agentflow::runs::{GeneratorSource, RunRegistry};

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Runs started through `POST /run`.
    pub registry: RunRegistry,
    /// Capability Provider for `POST /ask`, if configured.
    pub capabilities: Option<Arc<dyn CapabilityProvider>>,
    /// Generator used for `POST /ask`.
    pub ask_generator: GeneratorSource,
}

impl AppState {
    pub fn new(registry: RunRegistry, capabilities: Option<Arc<dyn CapabilityProvider>>) -> Self {
        Self {
            registry,
            capabilities,
            ask_generator: GeneratorSource::Configured,
        }
    }

    pub fn with_ask_generator(mut self, source: GeneratorSource) -> Self {
        self.ask_generator = source;
        self
    }
}
