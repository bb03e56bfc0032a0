//! Durable inventory of cloud resources created for a managed runtime
//!
//! Managed providers stream an entry onto an unbounded channel the moment a
//! resource exists. A drain task appends entries to the on-disk document and
//! rewrites it whole (through the same atomic-replace path as the registry),
//! so the file is always a parseable superset-consistent snapshot of what was
//! created. The inventory is the sole input to deletion: a partial write that
//! silently dropped an earlier entry would orphan a billed resource.
//!
//! The producer side closes deterministically when the provider's create (or
//! delete) call returns; the drain task ends when the channel closes and is
//! joined by the caller, never left dangling.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::write_atomic;
use crate::{Error, Result};

/// Kind of cloud resource recorded in the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Virtual network / VPC
    Network,
    /// Subnet within a network
    Subnet,
    /// Internet or NAT gateway
    Gateway,
    /// Managed Kubernetes cluster
    Cluster,
    /// Worker node group / pool
    NodeGroup,
    /// IAM-style role
    Role,
    /// IAM-style policy
    Policy,
    /// Access key / service account credential
    AccessKey,
    /// Resource group (Azure)
    ResourceGroup,
}

/// One created cloud resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// What kind of resource this is
    pub kind: ResourceKind,
    /// Provider-assigned identifier (ARN, resource id, ...)
    pub id: String,
    /// Human-readable name, when the provider has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ResourceEntry {
    /// Convenience constructor
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: None,
        }
    }

    /// Attach a human-readable name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// The persisted inventory document for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceInventory {
    /// Instance the resources belong to
    pub instance: String,
    /// Entries in creation order
    #[serde(default)]
    pub entries: Vec<ResourceEntry>,
}

impl ResourceInventory {
    /// Load the inventory from disk. A missing file is an empty inventory -
    /// deletion must be safe against partial creation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::registry(format!("failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| Error::registry(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Persist the whole document atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::registry(format!("failed to serialize inventory: {}", e)))?;
        write_atomic(path, &data)
    }

    /// Entries of a given kind, in creation order
    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }
}

/// Remove the inventory file. Missing file is fine.
pub fn remove_inventory(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::registry(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Channel pair handed to a managed provider before its blocking create call
pub struct ProviderStreams {
    /// Human-readable progress messages
    pub progress: UnboundedSender<String>,
    /// Inventory deltas
    pub inventory: UnboundedSender<ResourceEntry>,
}

/// Spawn the drain task that persists inventory deltas as they arrive.
///
/// The task ends when the sender side is dropped (i.e. when the provider's
/// create/delete call returns) and must be awaited by the caller so no write
/// is lost.
pub fn spawn_inventory_writer(
    path: PathBuf,
    instance: String,
    mut rx: UnboundedReceiver<ResourceEntry>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut inventory = ResourceInventory::load(&path)?;
        inventory.instance = instance;
        while let Some(entry) = rx.recv().await {
            debug!(kind = ?entry.kind, id = %entry.id, "Recording resource in inventory");
            inventory.entries.push(entry);
            // Rewrite on every delta: if the process dies mid-create, the
            // file still lists everything that exists so far.
            inventory.save(&path)?;
        }
        Ok(())
    })
}

/// Spawn the drain task that logs provider progress messages.
pub fn spawn_progress_logger(mut rx: UnboundedReceiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            info!(target: "stratus::provider", "{}", line);
        }
    })
}

/// Join a drain task, folding panics into errors
pub async fn join_drain(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Inventory drain task did not complete cleanly");
            Err(Error::registry(format!("inventory drain task failed: {}", e)))
        }
    }
}
