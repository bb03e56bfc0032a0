//! Azure AKS provider
//!
//! Drives the `az` CLI. Azure groups everything under a per-instance resource
//! group, so the inventory is short: the resource group and the managed
//! cluster inside it. Deleting the resource group takes the cluster and its
//! node pools with it, but both are inventoried so a delete can still target
//! the cluster when the group creation never finished.
//!
//! Credentials are AAD access tokens; `refresh_connection` requests a new one.
//!
//! Unlike the AWS variant there is no separate identity lifecycle here: the
//! cluster is created with `--enable-aad`, so Azure manages its identity and
//! role assignments as part of the cluster resource, and deleting the
//! resource group removes them along with everything else. No IAM-style
//! roles, policies or access keys are created out-of-band for this variant.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{info, warn};

use crate::identity::is_not_found;
use crate::inventory::{ProviderStreams, ResourceEntry, ResourceInventory, ResourceKind};
use crate::provider::{InfrastructureProvider, RuntimeCredential, RuntimeHandle};
use crate::{Error, Result};

/// AAD resource id of the AKS apiserver audience
const AKS_TOKEN_SERVER_ID: &str = "6dae42f8-4368-4678-94ff-3960e28e3630";

/// Provider that runs the control-plane runtime on Azure AKS
pub struct AksProvider {
    instance: String,
    location: String,
    resource_group: String,
    subscription: String,
    worker_nodes: u32,
    inventory_path: PathBuf,
    streams: Option<ProviderStreams>,
}

impl AksProvider {
    /// Create a provider for the named instance
    pub fn new(
        instance: String,
        location: String,
        resource_group: String,
        subscription: String,
        worker_nodes: u32,
        inventory_path: PathBuf,
        streams: Option<ProviderStreams>,
    ) -> Self {
        Self {
            instance,
            location,
            resource_group,
            subscription,
            worker_nodes,
            inventory_path,
            streams,
        }
    }

    fn cluster_name(&self) -> String {
        format!("stratus-{}", self.instance)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("az")
            .args(args)
            .args(["--subscription", &self.subscription])
            .args(["--output", "json"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::provider(format!("failed to run az {}: {}", args.join(" "), e)))?;

        if !output.status.success() {
            return Err(Error::provider(format!(
                "az {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json(&self, args: &[&str]) -> Result<serde_json::Value> {
        let out = self.run(args).await?;
        serde_json::from_str(&out)
            .map_err(|e| Error::provider(format!("az {} returned bad json: {}", args[0], e)))
    }

    fn progress(&self, message: impl Into<String>) {
        let message = message.into();
        match &self.streams {
            Some(streams) => {
                let _ = streams.progress.send(message);
            }
            None => info!("{}", message),
        }
    }

    fn record(&self, entry: ResourceEntry) {
        if let Some(streams) = &self.streams {
            let _ = streams.inventory.send(entry);
        }
    }

    async fn mint_token(&self) -> Result<RuntimeCredential> {
        let value = self
            .run_json(&[
                "account",
                "get-access-token",
                "--resource",
                AKS_TOKEN_SERVER_ID,
            ])
            .await?;
        let token = value["accessToken"]
            .as_str()
            .ok_or_else(|| Error::provider("get-access-token returned no accessToken"))?
            .to_string();
        let epoch = value["expires_on"]
            .as_i64()
            .ok_or_else(|| Error::provider("get-access-token returned no expires_on"))?;
        let expires_at: DateTime<Utc> = DateTime::from_timestamp(epoch, 0)
            .ok_or_else(|| Error::provider(format!("bad token expiry {}", epoch)))?;
        Ok(RuntimeCredential::Token { token, expires_at })
    }

    async fn delete_entry(&self, entry: &ResourceEntry) -> Result<()> {
        let result = match entry.kind {
            ResourceKind::Cluster => {
                self.progress(format!("Deleting AKS cluster {}", self.cluster_name()));
                self.run(&[
                    "aks",
                    "delete",
                    "--name",
                    &self.cluster_name(),
                    "--resource-group",
                    &self.resource_group,
                    "--yes",
                ])
                .await
                .map(|_| ())
            }
            ResourceKind::ResourceGroup => {
                self.progress(format!("Deleting resource group {}", entry.id));
                self.run(&["group", "delete", "--name", &entry.id, "--yes"])
                    .await
                    .map(|_| ())
            }
            _ => Ok(()),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => {
                warn!(id = %entry.id, "Resource already gone, continuing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl InfrastructureProvider for AksProvider {
    async fn create(&self) -> Result<RuntimeHandle> {
        self.progress(format!("Creating resource group {}", self.resource_group));
        self.run_json(&[
            "group",
            "create",
            "--name",
            &self.resource_group,
            "--location",
            &self.location,
        ])
        .await?;
        self.record(ResourceEntry::new(
            ResourceKind::ResourceGroup,
            &self.resource_group,
        ));

        let name = self.cluster_name();
        self.progress(format!("Creating AKS cluster {}", name));
        let workers = self.worker_nodes.to_string();
        let cluster = self
            .run_json(&[
                "aks",
                "create",
                "--name",
                &name,
                "--resource-group",
                &self.resource_group,
                "--location",
                &self.location,
                "--node-count",
                &workers,
                "--enable-aad",
            ])
            .await?;
        let id = cluster["id"]
            .as_str()
            .ok_or_else(|| Error::provider("aks create returned no cluster id"))?;
        self.record(ResourceEntry::new(ResourceKind::Cluster, id).named(&name));

        self.get_connection().await
    }

    async fn delete(&self) -> Result<()> {
        let inventory = ResourceInventory::load(&self.inventory_path)?;
        if inventory.entries.is_empty() {
            info!(instance = %self.instance, "No inventoried resources to delete");
            return Ok(());
        }

        let mut failures = Vec::new();
        for entry in inventory.entries.iter().rev() {
            if let Err(e) = self.delete_entry(entry).await {
                warn!(id = %entry.id, error = %e, "Failed to delete resource");
                failures.push(format!("{}: {}", entry.id, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::provider(failures.join("; ")))
        }
    }

    async fn get_connection(&self) -> Result<RuntimeHandle> {
        let value = self
            .run_json(&[
                "aks",
                "show",
                "--name",
                &self.cluster_name(),
                "--resource-group",
                &self.resource_group,
            ])
            .await?;
        let fqdn = value["fqdn"]
            .as_str()
            .ok_or_else(|| Error::provider("aks show returned no fqdn"))?;

        // The apiserver CA only ships inside the kubeconfig document
        let kubeconfig = self
            .run(&[
                "aks",
                "get-credentials",
                "--name",
                &self.cluster_name(),
                "--resource-group",
                &self.resource_group,
                "--file",
                "-",
            ])
            .await?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&kubeconfig)
            .map_err(|e| Error::provider(format!("failed to parse aks kubeconfig: {}", e)))?;
        let ca_b64 = doc["clusters"][0]["cluster"]["certificate-authority-data"]
            .as_str()
            .ok_or_else(|| Error::provider("aks kubeconfig has no CA data"))?;
        let ca_certificate = String::from_utf8(
            BASE64
                .decode(ca_b64)
                .map_err(|e| Error::provider(format!("invalid cluster CA data: {}", e)))?,
        )
        .map_err(|e| Error::provider(format!("non-utf8 cluster CA: {}", e)))?;

        Ok(RuntimeHandle {
            api_endpoint: format!("https://{}:443", fqdn),
            ca_certificate,
            credential: self.mint_token().await?,
        })
    }

    async fn refresh_connection(&self) -> Result<RuntimeHandle> {
        self.get_connection().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn provider(streams: Option<ProviderStreams>) -> AksProvider {
        AksProvider::new(
            "dev".to_string(),
            "eastus".to_string(),
            "stratus-dev-rg".to_string(),
            "00000000-0000-0000-0000-000000000000".to_string(),
            2,
            PathBuf::from("/tmp/inventory-dev.json"),
            streams,
        )
    }

    #[test]
    fn cluster_name_carries_instance() {
        assert_eq!(provider(None).cluster_name(), "stratus-dev");
    }

    #[test]
    fn resource_group_entries_go_to_the_stream() {
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let (inventory_tx, mut inventory_rx) = mpsc::unbounded_channel();
        let p = provider(Some(ProviderStreams {
            progress: progress_tx,
            inventory: inventory_tx,
        }));

        p.record(ResourceEntry::new(
            ResourceKind::ResourceGroup,
            "stratus-dev-rg",
        ));
        assert_eq!(inventory_rx.try_recv().unwrap().id, "stratus-dev-rg");
    }
}
