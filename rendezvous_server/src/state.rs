//! Server state
//!
//! One [`ServerState`] per server instance. It is cheap to clone and is
//! handed to every request handler and connection worker; there is no
//! process-wide registry.

use crate::config::RelaySettings;
use crate::matcher::Matcher;
use crate::registry::ClientRegistry;
use std::sync::Arc;

/// Shared state of one signaling server
#[derive(Debug, Clone)]
pub struct ServerState {
    registry: Arc<ClientRegistry>,
    matcher: Arc<Matcher>,
    settings: Arc<RelaySettings>,
}

impl ServerState {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            registry: Arc::new(ClientRegistry::new()),
            matcher: Arc::new(Matcher::new(settings.policy, settings.enforce_peer)),
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new(RelaySettings::default())
    }
}
