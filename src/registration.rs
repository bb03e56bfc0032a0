//! Self-registration against the control plane's own API
//!
//! Once the freshly installed API server answers its readiness probe, the
//! orchestrator records the runtime, the provider account metadata, and the
//! control plane itself as objects in that API (self-hosting bootstrap).
//! These records are not individually compensated: for a genesis instance
//! they live inside the infrastructure being torn down, so deleting the
//! infrastructure removes them transitively.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::config::ProviderKind;
use crate::inventory::ResourceInventory;
use crate::Result;

/// An installed control-plane component and its version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentVersion {
    /// Component name
    pub name: String,
    /// Deployed version
    pub version: String,
}

/// Provider metadata registered alongside the runtime
#[derive(Debug, Clone, Serialize)]
pub struct ProviderMetadata {
    /// Provider kind
    pub provider: ProviderKind,
    /// Cloud account identifier, when the provider has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Region or location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Worker node count
    pub worker_nodes: u32,
}

/// Counts of objects registered against a genesis control plane
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DependentCounts {
    /// Non-genesis control-plane instances
    pub control_planes: usize,
    /// Workload instances
    pub workloads: usize,
}

impl DependentCounts {
    /// True when nothing depends on the instance
    pub fn is_empty(&self) -> bool {
        self.control_planes == 0 && self.workloads == 0
    }
}

/// Thin JSON client for the control plane's REST API
pub struct RegistrationClient {
    base_url: String,
    client: reqwest::Client,
}

impl RegistrationClient {
    /// Build a client for the given API server endpoint
    pub fn new(api_server: impl Into<String>) -> Self {
        let base = api_server.into();
        Self {
            base_url: base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Register the Kubernetes runtime hosting this control plane: its
    /// definition first, then the instance pointing at the definition.
    pub async fn register_runtime(
        &self,
        instance: &str,
        api_endpoint: &str,
        metadata: &ProviderMetadata,
    ) -> Result<()> {
        info!(instance = %instance, "Registering runtime definition");
        self.post(
            "/v1/runtime-definitions",
            json!({
                "name": instance,
                "provider": metadata.provider,
            }),
        )
        .await?;

        info!(instance = %instance, "Registering runtime instance");
        self.post(
            "/v1/runtimes",
            json!({
                "name": instance,
                "definition": instance,
                "endpoint": api_endpoint,
            }),
        )
        .await
    }

    /// Register the cloud account metadata and a snapshot of the inventoried
    /// resources the runtime sits on.
    pub async fn register_provider_metadata(
        &self,
        instance: &str,
        metadata: &ProviderMetadata,
        inventory: &ResourceInventory,
    ) -> Result<()> {
        info!(instance = %instance, provider = %metadata.provider, "Registering provider metadata");
        self.post(
            "/v1/accounts",
            json!({
                "name": instance,
                "provider": metadata.provider,
                "account": metadata.account,
                "region": metadata.region,
                "workerNodes": metadata.worker_nodes,
                "resources": inventory.entries,
            }),
        )
        .await
    }

    /// Register the control plane itself, with the list of installed
    /// component versions.
    pub async fn register_control_plane(
        &self,
        instance: &str,
        genesis: bool,
        components: &[ComponentVersion],
    ) -> Result<()> {
        info!(instance = %instance, "Registering control-plane definition");
        self.post(
            "/v1/control-plane-definitions",
            json!({
                "name": instance,
                "components": components,
            }),
        )
        .await?;

        info!(instance = %instance, "Registering control-plane instance");
        self.post(
            "/v1/control-planes",
            json!({
                "name": instance,
                "definition": instance,
                "genesis": genesis,
            }),
        )
        .await
    }

    /// Count objects registered against this control plane. Used by the
    /// deletion workflow before it will touch a genesis instance.
    pub async fn count_dependents(&self, instance: &str) -> Result<DependentCounts> {
        let control_planes: Vec<serde_json::Value> = self
            .client
            .get(self.url("/v1/control-planes"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let workloads: Vec<serde_json::Value> = self
            .client
            .get(self.url("/v1/workloads"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // The instance's own record is not a dependent
        let others = control_planes
            .iter()
            .filter(|cp| cp.get("name").and_then(|n| n.as_str()) != Some(instance))
            .count();
        Ok(DependentCounts {
            control_planes: others,
            workloads: workloads.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = RegistrationClient::new("https://api.dev.example.com/");
        assert_eq!(
            client.url("/v1/runtimes"),
            "https://api.dev.example.com/v1/runtimes"
        );
    }

    #[test]
    fn dependent_counts_emptiness() {
        assert!(DependentCounts::default().is_empty());
        assert!(!DependentCounts {
            control_planes: 1,
            workloads: 0
        }
        .is_empty());
        assert!(!DependentCounts {
            control_planes: 0,
            workloads: 2
        }
        .is_empty());
    }

    #[test]
    fn component_versions_serialize_flat() {
        let c = ComponentVersion {
            name: "stratus-api".to_string(),
            version: "0.1.0".to_string(),
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["name"], "stratus-api");
        assert_eq!(v["version"], "0.1.0");
    }
}
