// ABOUTME: Name-to-factory registry so the backend type is a config value.
// ABOUTME: Factories take a JSON config blob and hand back a live AgentHandle.

use crate::handle::AgentHandle;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Builds a running backend (worker already spawned) from its config.
pub type BackendFactory = Box<dyn Fn(&Value) -> Result<AgentHandle> + Send + Sync>;

/// Runtime backend selection by name.
pub struct AgentRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<AgentHandle> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    /// Instantiate a backend by name.
    pub fn create(&self, name: &str, config: &Value) -> Result<AgentHandle> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("unknown agent backend: {name}"))?;
        factory(config)
    }

    /// Registered backend names, for diagnostics and `!status` output.
    pub fn available(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        use crate::backends::cli::CliBackend;
        use crate::backends::mock::MockBackend;

        let registry = Self::new()
            .register("mock", MockBackend::factory())
            .register("cli", CliBackend::factory());

        #[cfg(feature = "acp")]
        let registry = {
            use crate::backends::acp::AcpBackend;
            registry.register("acp", AcpBackend::factory())
        };

        registry
    }
}
