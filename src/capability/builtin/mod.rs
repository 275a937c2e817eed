pub mod http_get;
pub mod sprintf;

use std::sync::Arc;

use anyhow::Result;

pub use http_get::HttpGet;
pub use sprintf::Sprintf;

use super::CapabilityRegistry;

/// Registry with every builtin capability, `httpGet` going through `client`.
pub fn default_registry(client: reqwest::Client) -> Result<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(HttpGet::new(client)))?;
    registry.register(Arc::new(Sprintf))?;
    Ok(registry)
}
