use std::collections::HashMap;
use std::sync::Arc;

use drover_core::error::{DroverError, Result};
use drover_core::output::CapabilityResult;
use drover_core::traits::Capability;
use drover_core::types::Payload;

/// Registry of available capabilities.
///
/// Built once and handed to workers; there is no global lookup.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability.
    pub fn register(&mut self, capability: impl Capability) {
        let name = capability.name().to_string();
        self.capabilities.insert(name, Arc::new(capability));
    }

    /// Unregister a capability by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.capabilities.remove(name).is_some()
    }

    /// Get a capability by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Execute a capability by name, bounded by its own timeout.
    pub async fn execute(&self, name: &str, input: Payload) -> Result<CapabilityResult> {
        let capability = self
            .get(name)
            .ok_or_else(|| DroverError::CapabilityNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(capability.timeout_secs());

        match tokio::time::timeout(timeout, capability.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(DroverError::CapabilityTimeout {
                capability: name.to_string(),
                timeout_secs: capability.timeout_secs(),
            }),
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
