//! Local instance registry stored at `~/.stratus/`.
//!
//! The registry is the durable record of every control-plane instance the
//! operator has created: provider kind, endpoint, credentials, genesis flag.
//! It is the only state shared across process invocations, so every mutation
//! rewrites the whole document atomically (write-temp-then-rename) - a
//! half-written registry must never be observable.
//!
//! Files:
//! - `~/.stratus/config.yaml` - instance records plus the current-instance selector
//! - `~/.stratus/inventory-<name>.json` - per-instance cloud resource inventory
//!
//! The registry enforces no cross-instance rules. Genesis protection (refusing
//! to delete a genesis instance with live dependents) belongs to the
//! workflows, which can ask the control-plane API about dependents; the
//! registry cannot.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".stratus";
const CONFIG_FILE_NAME: &str = "config.yaml";

/// Infrastructure substrate an instance runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local kind-backed runtime
    #[default]
    Local,
    /// AWS EKS managed runtime
    Eks,
    /// Azure AKS managed runtime
    Aks,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Eks => write!(f, "eks"),
            ProviderKind::Aks => write!(f, "aks"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(ProviderKind::Local),
            "eks" => Ok(ProviderKind::Eks),
            "aks" => Ok(ProviderKind::Aks),
            other => Err(Error::validation(format!(
                "unsupported infrastructure provider '{}' (expected local, eks or aks)",
                other
            ))),
        }
    }
}

/// How far a provisioning run got. Persisted at each milestone so an
/// interrupted run is diagnosable from the registry alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionState {
    /// Skeleton record created, nothing provisioned yet
    #[default]
    Init,
    /// Kubernetes runtime exists
    InfraReady,
    /// Encryption key, certificates and database credentials generated
    SecretsReady,
    /// Control-plane components applied to the runtime
    ComponentsInstalled,
    /// Control-plane API answered a readiness probe
    ApiReachable,
    /// Authentication components installed
    AuthInstalled,
    /// Reconciler controllers installed
    ControllersInstalled,
    /// In-cluster agent installed
    AgentInstalled,
    /// Runtime/account/control-plane registered through the instance's own API
    SelfRegistered,
    /// Provisioning finished
    Complete,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionState::Init => "init",
            ProvisionState::InfraReady => "infra-ready",
            ProvisionState::SecretsReady => "secrets-ready",
            ProvisionState::ComponentsInstalled => "components-installed",
            ProvisionState::ApiReachable => "api-reachable",
            ProvisionState::AuthInstalled => "auth-installed",
            ProvisionState::ControllersInstalled => "controllers-installed",
            ProvisionState::AgentInstalled => "agent-installed",
            ProvisionState::SelfRegistered => "self-registered",
            ProvisionState::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// Credential stored for reconnecting to an instance's Kubernetes runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum StoredCredential {
    /// Static client certificate (local runtimes)
    Certificate {
        /// PEM client certificate
        cert: String,
        /// PEM client key
        key: String,
    },
    /// Time-limited bearer token (managed runtimes)
    Token {
        /// Bearer token
        token: String,
        /// When the token stops being accepted
        expires_at: DateTime<Utc>,
    },
}

/// Connection details for an instance's Kubernetes runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeConnection {
    /// Kubernetes API endpoint URL
    pub api_endpoint: String,
    /// PEM CA certificate of the runtime
    pub ca_certificate: String,
    /// Credential used to authenticate
    pub credential: StoredCredential,
}

/// Provider-specific sub-configuration persisted with an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "provider")]
pub enum ProviderConfig {
    /// AWS EKS addressing
    Eks {
        /// AWS region the runtime lives in
        region: String,
        /// Local AWS profile used for API calls
        profile: String,
        /// AWS account id, once known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account_id: Option<String>,
    },
    /// Azure AKS addressing
    Aks {
        /// Azure location
        location: String,
        /// Resource group holding the runtime
        resource_group: String,
        /// Subscription id
        subscription: String,
        /// Tenant id, once known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tenant: Option<String>,
    },
}

/// One deployed control plane plus its metadata record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ControlPlaneInstance {
    /// Unique, operator-chosen name
    pub name: String,
    /// Infrastructure substrate
    pub provider: ProviderKind,
    /// True for the first, self-hosting instance. Genesis instances refuse
    /// deletion while dependents exist; non-genesis records must reference a
    /// reachable genesis API.
    pub genesis: bool,
    /// Namespace the components are installed into
    pub namespace: String,
    /// Whether authentication components are installed
    pub auth_enabled: bool,
    /// How far provisioning got
    #[serde(default)]
    pub state: ProvisionState,
    /// Control-plane API server endpoint, once reachable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,
    /// Symmetric key protecting credentials persisted server-side (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// PEM CA certificate for the control plane's own PKI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,
    /// PEM client certificate/key pair for the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    /// PEM client key paired with `client_certificate`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// Kubernetes runtime connection details, once the runtime exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube: Option<KubeConnection>,
    /// Provider-specific addressing (cloud variants only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<ProviderConfig>,
}

/// The persisted registry document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryDocument {
    /// All known instances
    #[serde(default)]
    instances: Vec<ControlPlaneInstance>,
    /// Name of the instance subsequent commands act on by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_instance: Option<String>,
}

/// Handle to the registry file. Cheap to clone; every operation re-reads the
/// document so separate handles observe each other's writes.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    path: PathBuf,
}

impl InstanceRegistry {
    /// Open the registry in the default location (`~/.stratus/config.yaml`),
    /// creating the directory if needed
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::registry("could not determine home directory"))?;
        Self::open_in(home.join(CONFIG_DIR_NAME))
    }

    /// Open the registry under an explicit directory (used by tests and the
    /// `--config-dir` flag)
    pub fn open_in(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::registry(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(Self {
            path: dir.join(CONFIG_FILE_NAME),
        })
    }

    /// Directory the registry file lives in
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    /// Path of the inventory file for an instance name
    pub fn inventory_path(&self, name: &str) -> PathBuf {
        self.dir().join(format!("inventory-{}.json", name))
    }

    fn load(&self) -> Result<RegistryDocument> {
        if !self.path.exists() {
            return Ok(RegistryDocument::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::registry(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        serde_yaml::from_str(&data).map_err(|e| {
            Error::registry(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }

    fn persist(&self, doc: &RegistryDocument) -> Result<()> {
        let data = serde_yaml::to_string(doc)
            .map_err(|e| Error::registry(format!("failed to serialize registry: {}", e)))?;
        write_atomic(&self.path, data.as_bytes())
    }

    /// True if an instance with this name is recorded
    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.load()?.instances.iter().any(|i| i.name == name))
    }

    /// Fetch an instance record by name
    pub fn get(&self, name: &str) -> Result<ControlPlaneInstance> {
        self.load()?
            .instances
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::state_conflict(format!("instance '{}' not found", name)))
    }

    /// All recorded instances
    pub fn list(&self) -> Result<Vec<ControlPlaneInstance>> {
        Ok(self.load()?.instances)
    }

    /// Insert a new instance record. Fails if the name is taken unless
    /// `overwrite` is set, in which case the old record is replaced.
    pub fn insert(&self, instance: ControlPlaneInstance, overwrite: bool) -> Result<()> {
        let mut doc = self.load()?;
        if let Some(pos) = doc.instances.iter().position(|i| i.name == instance.name) {
            if !overwrite {
                return Err(Error::state_conflict(format!(
                    "instance '{}' already exists (use force-overwrite to replace it)",
                    instance.name
                )));
            }
            doc.instances[pos] = instance;
        } else {
            doc.instances.push(instance);
        }
        self.persist(&doc)
    }

    /// Atomic read-modify-write of one instance. The mutation is applied to a
    /// copy of the record and the whole document is replaced in one rename -
    /// a failed write leaves the previous document fully intact.
    pub fn upsert<F>(&self, name: &str, mutate: F) -> Result<ControlPlaneInstance>
    where
        F: FnOnce(&mut ControlPlaneInstance),
    {
        let mut doc = self.load()?;
        let instance = doc
            .instances
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::state_conflict(format!("instance '{}' not found", name)))?;
        mutate(instance);
        let updated = instance.clone();
        self.persist(&doc)?;
        Ok(updated)
    }

    /// Remove an instance record. Clears the current-instance selector if it
    /// pointed at the removed instance. Removing a missing record is a no-op.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut doc = self.load()?;
        doc.instances.retain(|i| i.name != name);
        if doc.current_instance.as_deref() == Some(name) {
            doc.current_instance = None;
        }
        self.persist(&doc)
    }

    /// True if the named instance carries the genesis flag
    pub fn is_genesis(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.genesis)
    }

    /// Name of the current instance, if one is selected
    pub fn current(&self) -> Result<Option<String>> {
        Ok(self.load()?.current_instance)
    }

    /// Select the instance subsequent commands act on by default
    pub fn set_current(&self, name: &str) -> Result<()> {
        let mut doc = self.load()?;
        if !doc.instances.iter().any(|i| i.name == name) {
            return Err(Error::state_conflict(format!(
                "instance '{}' not found",
                name
            )));
        }
        doc.current_instance = Some(name.to_string());
        self.persist(&doc)
    }
}

/// Replace the file at `path` with `data` via a temp file in the same
/// directory followed by a rename. Readers see either the old document or the
/// new one, never a partial write.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        Error::registry(format!("{} has no parent directory", path.display()))
    })?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stratus".to_string())
    ));
    std::fs::write(&tmp, data)
        .map_err(|e| Error::registry(format!("failed to write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        // Leave no temp file behind on a failed rename
        let _ = std::fs::remove_file(&tmp);
        Error::registry(format!("failed to replace {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, InstanceRegistry) {
        let dir = TempDir::new().expect("tempdir");
        let reg = InstanceRegistry::open_in(dir.path()).expect("open registry");
        (dir, reg)
    }

    fn instance(name: &str) -> ControlPlaneInstance {
        ControlPlaneInstance {
            name: name.to_string(),
            provider: ProviderKind::Local,
            genesis: true,
            namespace: crate::DEFAULT_NAMESPACE.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_get_remove_lifecycle() {
        let (_dir, reg) = registry();

        assert!(!reg.exists("dev").unwrap());
        reg.insert(instance("dev"), false).unwrap();
        assert!(reg.exists("dev").unwrap());

        let got = reg.get("dev").unwrap();
        assert_eq!(got.provider, ProviderKind::Local);
        assert!(got.genesis);
        assert!(reg.is_genesis("dev").unwrap());

        reg.remove("dev").unwrap();
        assert!(!reg.exists("dev").unwrap());
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn insert_refuses_duplicate_without_overwrite() {
        let (_dir, reg) = registry();
        reg.insert(instance("dev"), false).unwrap();

        let err = reg.insert(instance("dev"), false).unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)), "got: {}", err);

        // Overwrite replaces the record
        let mut replacement = instance("dev");
        replacement.auth_enabled = true;
        reg.insert(replacement, true).unwrap();
        assert!(reg.get("dev").unwrap().auth_enabled);
        assert_eq!(reg.list().unwrap().len(), 1);
    }

    #[test]
    fn upsert_mutates_one_instance_and_keeps_others() {
        let (_dir, reg) = registry();
        reg.insert(instance("dev"), false).unwrap();
        reg.insert(instance("prod"), false).unwrap();

        let updated = reg
            .upsert("dev", |i| {
                i.state = ProvisionState::InfraReady;
                i.api_server = Some("http://localhost:1323".to_string());
            })
            .unwrap();
        assert_eq!(updated.state, ProvisionState::InfraReady);

        // The other instance is untouched and the file still parses
        let prod = reg.get("prod").unwrap();
        assert_eq!(prod.state, ProvisionState::Init);
        let dev = reg.get("dev").unwrap();
        assert_eq!(dev.api_server.as_deref(), Some("http://localhost:1323"));
    }

    #[test]
    fn upsert_missing_instance_is_state_conflict() {
        let (_dir, reg) = registry();
        let err = reg.upsert("ghost", |_| {}).unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)));
    }

    #[test]
    fn every_mutation_leaves_a_parseable_document() {
        let (dir, reg) = registry();
        reg.insert(instance("a"), false).unwrap();
        reg.insert(instance("b"), false).unwrap();
        reg.upsert("a", |i| i.state = ProvisionState::Complete)
            .unwrap();
        reg.remove("b").unwrap();

        // Parse the raw file the way a fresh process would
        let raw = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        let doc: RegistryDocument = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(doc.instances.len(), 1);
        assert_eq!(doc.instances[0].name, "a");
        assert_eq!(doc.instances[0].state, ProvisionState::Complete);

        // No temp file left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn current_instance_selector() {
        let (_dir, reg) = registry();
        assert!(reg.current().unwrap().is_none());

        reg.insert(instance("dev"), false).unwrap();
        reg.set_current("dev").unwrap();
        assert_eq!(reg.current().unwrap().as_deref(), Some("dev"));

        // Selector for a missing instance is refused
        assert!(matches!(
            reg.set_current("ghost").unwrap_err(),
            Error::StateConflict(_)
        ));

        // Removing the current instance clears the selector
        reg.remove("dev").unwrap();
        assert!(reg.current().unwrap().is_none());
    }

    #[test]
    fn provider_kind_parses_from_cli_strings() {
        assert_eq!("local".parse::<ProviderKind>().unwrap(), ProviderKind::Local);
        assert_eq!("eks".parse::<ProviderKind>().unwrap(), ProviderKind::Eks);
        assert_eq!("aks".parse::<ProviderKind>().unwrap(), ProviderKind::Aks);
        assert!(matches!(
            "gce".parse::<ProviderKind>().unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn stored_credential_roundtrip_with_expiry() {
        let conn = KubeConnection {
            api_endpoint: "https://10.0.0.1:6443".to_string(),
            ca_certificate: "-----BEGIN CERTIFICATE-----".to_string(),
            credential: StoredCredential::Token {
                token: "k8s-aws-v1.abc".to_string(),
                expires_at: Utc::now(),
            },
        };
        let yaml = serde_yaml::to_string(&conn).unwrap();
        let parsed: KubeConnection = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, conn);
    }
}
