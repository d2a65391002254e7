use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::FirewallProvider;

/// Maps a configured integration's `provider` tag to its client instance.
/// Populated once at startup from the integrations table; integrations are
/// reloaded by restarting the daemon, matching the rest of the config
/// surface (whitelist and detection rules hot-reload, integrations do not,
/// since they carry live credentials).
#[derive(Default, Clone)]
pub struct FirewallRegistry {
    providers: HashMap<i64, Arc<dyn FirewallProvider>>,
}

impl FirewallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, integration_id: i64, provider: Arc<dyn FirewallProvider>) {
        self.providers.insert(integration_id, provider);
    }

    pub fn get(&self, integration_id: i64) -> Option<Arc<dyn FirewallProvider>> {
        self.providers.get(&integration_id).cloned()
    }

    pub fn integration_ids(&self) -> Vec<i64> {
        self.providers.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noop_provider::NoopProvider;

    #[test]
    fn register_and_fetch() {
        let mut registry = FirewallRegistry::new();
        registry.register(1, Arc::new(NoopProvider::new()));
        assert!(registry.get(1).is_some());
        assert!(registry.get(2).is_none());
    }

    #[test]
    fn unknown_integration_returns_none() {
        let registry = FirewallRegistry::new();
        assert!(registry.get(99).is_none());
    }
}
