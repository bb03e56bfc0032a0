//! AWS EKS provider
//!
//! Drives the `aws` CLI for every resource: a VPC with two public subnets and
//! an internet gateway, then the EKS cluster and its managed node group.
//! Every created resource goes onto the inventory channel the moment its id
//! is known, so a creation interrupted at any point still leaves a complete
//! record behind for deletion.
//!
//! Connection credentials are STS-derived bearer tokens with roughly a
//! fifteen-minute lifetime; `refresh_connection` mints a new one.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{info, warn};

use crate::identity::{self, is_not_found};
use crate::inventory::{ProviderStreams, ResourceEntry, ResourceInventory, ResourceKind};
use crate::provider::{InfrastructureProvider, RuntimeCredential, RuntimeHandle};
use crate::{Error, Result};

/// CIDR of the VPC created per instance
const VPC_CIDR: &str = "10.40.0.0/16";

/// Subnet CIDRs, one per availability zone
const SUBNET_CIDRS: [&str; 2] = ["10.40.1.0/24", "10.40.2.0/24"];

/// Provider that runs the control-plane runtime on AWS EKS
pub struct EksProvider {
    instance: String,
    region: String,
    profile: String,
    worker_nodes: u32,
    inventory_path: PathBuf,
    streams: Option<ProviderStreams>,
}

impl EksProvider {
    /// Create a provider for the named instance
    pub fn new(
        instance: String,
        region: String,
        profile: String,
        worker_nodes: u32,
        inventory_path: PathBuf,
        streams: Option<ProviderStreams>,
    ) -> Self {
        Self {
            instance,
            region,
            profile,
            worker_nodes,
            inventory_path,
            streams,
        }
    }

    fn cluster_name(&self) -> String {
        format!("stratus-{}", self.instance)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("aws")
            .args(args)
            .args(["--profile", &self.profile, "--region", &self.region])
            .args(["--output", "json"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::provider(format!("failed to run aws {}: {}", args.join(" "), e)))?;

        if !output.status.success() {
            return Err(Error::provider(format!(
                "aws {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json(&self, args: &[&str]) -> Result<serde_json::Value> {
        let out = self.run(args).await?;
        serde_json::from_str(&out)
            .map_err(|e| Error::provider(format!("aws {} returned bad json: {}", args[0], e)))
    }

    fn progress(&self, message: impl Into<String>) {
        let message = message.into();
        match &self.streams {
            // Receiver gone means the drain task died; losing a progress line
            // is not worth failing the provisioning over
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

    fn json_str(value: &serde_json::Value, path: &[&str]) -> Result<String> {
        let mut cur = value;
        for key in path {
            cur = &cur[*key];
        }
        cur.as_str()
            .map(String::from)
            .ok_or_else(|| Error::provider(format!("aws response missing {}", path.join("."))))
    }

    async fn create_network(&self) -> Result<(String, Vec<String>)> {
        self.progress("Creating VPC");
        let vpc = self
            .run_json(&["ec2", "create-vpc", "--cidr-block", VPC_CIDR])
            .await?;
        let vpc_id = Self::json_str(&vpc, &["Vpc", "VpcId"])?;
        self.record(ResourceEntry::new(ResourceKind::Network, &vpc_id));

        self.run(&[
            "ec2",
            "modify-vpc-attribute",
            "--vpc-id",
            &vpc_id,
            "--enable-dns-hostnames",
        ])
        .await?;

        let zones = self
            .run_json(&["ec2", "describe-availability-zones"])
            .await?;
        let mut subnet_ids = Vec::new();
        for (i, cidr) in SUBNET_CIDRS.iter().enumerate() {
            let zone = Self::json_str(&zones["AvailabilityZones"][i], &["ZoneName"])?;
            self.progress(format!("Creating subnet in {}", zone));
            let subnet = self
                .run_json(&[
                    "ec2",
                    "create-subnet",
                    "--vpc-id",
                    &vpc_id,
                    "--cidr-block",
                    cidr,
                    "--availability-zone",
                    &zone,
                ])
                .await?;
            let subnet_id = Self::json_str(&subnet, &["Subnet", "SubnetId"])?;
            self.record(ResourceEntry::new(ResourceKind::Subnet, &subnet_id).named(zone));
            self.run(&[
                "ec2",
                "modify-subnet-attribute",
                "--subnet-id",
                &subnet_id,
                "--map-public-ip-on-launch",
            ])
            .await?;
            subnet_ids.push(subnet_id);
        }

        self.progress("Creating internet gateway");
        let igw = self.run_json(&["ec2", "create-internet-gateway"]).await?;
        let igw_id = Self::json_str(&igw, &["InternetGateway", "InternetGatewayId"])?;
        self.record(ResourceEntry::new(ResourceKind::Gateway, &igw_id).named(&vpc_id));
        self.run(&[
            "ec2",
            "attach-internet-gateway",
            "--internet-gateway-id",
            &igw_id,
            "--vpc-id",
            &vpc_id,
        ])
        .await?;

        let tables = self
            .run_json(&[
                "ec2",
                "describe-route-tables",
                "--filters",
                &format!("Name=vpc-id,Values={}", vpc_id),
            ])
            .await?;
        let table_id = Self::json_str(&tables["RouteTables"][0], &["RouteTableId"])?;
        self.run(&[
            "ec2",
            "create-route",
            "--route-table-id",
            &table_id,
            "--destination-cidr-block",
            "0.0.0.0/0",
            "--gateway-id",
            &igw_id,
        ])
        .await?;

        Ok((vpc_id, subnet_ids))
    }

    async fn create_cluster(&self, subnet_ids: &[String]) -> Result<()> {
        let account = self.account_id().await?;
        let role_arn = format!(
            "arn:aws:iam::{}:role/{}",
            account,
            identity::runtime_management_role(&self.instance)
        );
        let name = self.cluster_name();
        let subnets = subnet_ids.join(",");

        self.progress(format!("Creating EKS cluster {}", name));
        let cluster = self
            .run_json(&[
                "eks",
                "create-cluster",
                "--name",
                &name,
                "--role-arn",
                &role_arn,
                "--resources-vpc-config",
                &format!("subnetIds={}", subnets),
            ])
            .await?;
        let arn = Self::json_str(&cluster, &["cluster", "arn"])?;
        self.record(ResourceEntry::new(ResourceKind::Cluster, arn).named(&name));

        self.progress("Waiting for cluster to become active");
        self.run(&["eks", "wait", "cluster-active", "--name", &name])
            .await?;

        self.progress("Creating node group");
        let workers = self.worker_nodes.to_string();
        self.run_json(&[
            "eks",
            "create-nodegroup",
            "--cluster-name",
            &name,
            "--nodegroup-name",
            &format!("{}-workers", name),
            "--node-role",
            &role_arn,
            "--subnets",
            &subnets,
            "--scaling-config",
            &format!("minSize=1,maxSize={workers},desiredSize={workers}"),
        ])
        .await?;
        self.record(
            ResourceEntry::new(ResourceKind::NodeGroup, format!("{}-workers", name)).named(&name),
        );

        self.progress("Waiting for node group to become active");
        self.run(&[
            "eks",
            "wait",
            "nodegroup-active",
            "--cluster-name",
            &name,
            "--nodegroup-name",
            &format!("{}-workers", name),
        ])
        .await?;
        Ok(())
    }

    async fn account_id(&self) -> Result<String> {
        let value = self.run_json(&["sts", "get-caller-identity"]).await?;
        Self::json_str(&value, &["Account"])
    }

    async fn mint_token(&self) -> Result<RuntimeCredential> {
        let value = self
            .run_json(&["eks", "get-token", "--cluster-name", &self.cluster_name()])
            .await?;
        let token = Self::json_str(&value, &["status", "token"])?;
        let expiry = Self::json_str(&value, &["status", "expirationTimestamp"])?;
        let expires_at: DateTime<Utc> = expiry
            .parse()
            .map_err(|e| Error::provider(format!("bad token expiry '{}': {}", expiry, e)))?;
        Ok(RuntimeCredential::Token { token, expires_at })
    }

    /// Delete one inventoried resource. Not-found means an earlier attempt
    /// already removed it.
    async fn delete_entry(&self, entry: &ResourceEntry) -> Result<()> {
        let name = self.cluster_name();
        let result = match entry.kind {
            ResourceKind::NodeGroup => {
                self.progress(format!("Deleting node group {}", entry.id));
                let r = self
                    .run(&[
                        "eks",
                        "delete-nodegroup",
                        "--cluster-name",
                        &name,
                        "--nodegroup-name",
                        &entry.id,
                    ])
                    .await;
                if r.is_ok() {
                    self.run(&[
                        "eks",
                        "wait",
                        "nodegroup-deleted",
                        "--cluster-name",
                        &name,
                        "--nodegroup-name",
                        &entry.id,
                    ])
                    .await?;
                }
                r.map(|_| ())
            }
            ResourceKind::Cluster => {
                self.progress(format!("Deleting EKS cluster {}", name));
                let r = self
                    .run(&["eks", "delete-cluster", "--name", &name])
                    .await;
                if r.is_ok() {
                    self.run(&["eks", "wait", "cluster-deleted", "--name", &name])
                        .await?;
                }
                r.map(|_| ())
            }
            ResourceKind::Gateway => {
                self.progress(format!("Deleting internet gateway {}", entry.id));
                if let Some(vpc_id) = &entry.name {
                    let detach = self
                        .run(&[
                            "ec2",
                            "detach-internet-gateway",
                            "--internet-gateway-id",
                            &entry.id,
                            "--vpc-id",
                            vpc_id,
                        ])
                        .await;
                    if let Err(e) = detach {
                        if !is_not_found(&e) {
                            return Err(e);
                        }
                    }
                }
                self.run(&[
                    "ec2",
                    "delete-internet-gateway",
                    "--internet-gateway-id",
                    &entry.id,
                ])
                .await
                .map(|_| ())
            }
            ResourceKind::Subnet => {
                self.progress(format!("Deleting subnet {}", entry.id));
                self.run(&["ec2", "delete-subnet", "--subnet-id", &entry.id])
                    .await
                    .map(|_| ())
            }
            ResourceKind::Network => {
                self.progress(format!("Deleting VPC {}", entry.id));
                self.run(&["ec2", "delete-vpc", "--vpc-id", &entry.id])
                    .await
                    .map(|_| ())
            }
            // Identity resources are the identity manager's responsibility
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
impl InfrastructureProvider for EksProvider {
    async fn create(&self) -> Result<RuntimeHandle> {
        let (_vpc_id, subnet_ids) = self.create_network().await?;
        self.create_cluster(&subnet_ids).await?;
        self.get_connection().await
    }

    async fn delete(&self) -> Result<()> {
        let inventory = ResourceInventory::load(&self.inventory_path)?;
        if inventory.entries.is_empty() {
            info!(instance = %self.instance, "No inventoried resources to delete");
            return Ok(());
        }

        // Reverse creation order: node group before cluster, cluster before
        // network
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
            .run_json(&["eks", "describe-cluster", "--name", &self.cluster_name()])
            .await?;
        let api_endpoint = Self::json_str(&value, &["cluster", "endpoint"])?;
        let ca_b64 = Self::json_str(&value, &["cluster", "certificateAuthority", "data"])?;
        let ca_certificate = String::from_utf8(
            BASE64
                .decode(&ca_b64)
                .map_err(|e| Error::provider(format!("invalid cluster CA data: {}", e)))?,
        )
        .map_err(|e| Error::provider(format!("non-utf8 cluster CA: {}", e)))?;

        Ok(RuntimeHandle {
            api_endpoint,
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

    fn provider(streams: Option<ProviderStreams>) -> EksProvider {
        EksProvider::new(
            "dev".to_string(),
            "us-east-1".to_string(),
            "default".to_string(),
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
    fn json_str_walks_nested_paths() {
        let value = serde_json::json!({"cluster": {"endpoint": "https://x"}});
        assert_eq!(
            EksProvider::json_str(&value, &["cluster", "endpoint"]).unwrap(),
            "https://x"
        );
        assert!(EksProvider::json_str(&value, &["cluster", "missing"]).is_err());
    }

    #[test]
    fn inventory_entries_go_to_the_stream() {
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let (inventory_tx, mut inventory_rx) = mpsc::unbounded_channel();
        let p = provider(Some(ProviderStreams {
            progress: progress_tx,
            inventory: inventory_tx,
        }));

        p.record(ResourceEntry::new(ResourceKind::Network, "vpc-1"));
        let entry = inventory_rx.try_recv().unwrap();
        assert_eq!(entry.id, "vpc-1");
    }

    #[test]
    fn progress_without_streams_does_not_panic() {
        provider(None).progress("creating things");
    }
}
