//! Infrastructure provider abstraction layer
//!
//! A provider can create, delete and describe connection information for a
//! Kubernetes runtime on one substrate. The orchestrator holds a single
//! `Box<dyn InfrastructureProvider>` and never inspects the concrete variant;
//! everything variant-specific (identity pre-steps, inventory streaming) is
//! wired in when the provider is constructed.
//!
//! # Supported Providers
//!
//! - [`LocalProvider`] - kind-backed local runtime, static certificate credential
//! - [`EksProvider`] - AWS EKS managed runtime, expiring STS token credential
//! - [`AksProvider`] - Azure AKS managed runtime, expiring bearer token credential
//!
//! `delete` must be safe to call against a partial creation: it takes its
//! input from the resource inventory, skips resources that no longer exist,
//! and aggregates sub-resource failures instead of stopping at the first one.

mod aks;
mod eks;
mod local;

pub use aks::AksProvider;
pub use eks::EksProvider;
pub use local::LocalProvider;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde_json::json;

use crate::config::{KubeConnection, ProviderConfig, ProviderKind, StoredCredential};
use crate::inventory::ProviderStreams;
use crate::{Error, Result};

/// A token this close to expiry is treated as already expired so no call
/// starts with a credential that dies mid-flight.
const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;

/// Credential carried by a [`RuntimeHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCredential {
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

/// Live connection information for a Kubernetes runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    /// Kubernetes API endpoint URL
    pub api_endpoint: String,
    /// PEM CA certificate of the runtime
    pub ca_certificate: String,
    /// Credential used to authenticate
    pub credential: RuntimeCredential,
}

impl RuntimeHandle {
    /// True if the credential is expired or within the safety skew of
    /// expiring. Certificate credentials never expire here.
    pub fn is_expired(&self) -> bool {
        match &self.credential {
            RuntimeCredential::Certificate { .. } => false,
            RuntimeCredential::Token { expires_at, .. } => {
                *expires_at - ChronoDuration::seconds(TOKEN_EXPIRY_SKEW_SECS) <= Utc::now()
            }
        }
    }

    /// Build an in-memory kubeconfig for this handle
    fn to_kubeconfig(&self) -> Result<Kubeconfig> {
        let ca_data = BASE64.encode(self.ca_certificate.as_bytes());
        let user = match &self.credential {
            RuntimeCredential::Certificate { cert, key } => json!({
                "client-certificate-data": BASE64.encode(cert.as_bytes()),
                "client-key-data": BASE64.encode(key.as_bytes()),
            }),
            RuntimeCredential::Token { token, .. } => json!({ "token": token }),
        };
        let doc = json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": "stratus",
                "cluster": {
                    "server": self.api_endpoint,
                    "certificate-authority-data": ca_data,
                }
            }],
            "users": [{ "name": "stratus", "user": user }],
            "contexts": [{
                "name": "stratus",
                "context": { "cluster": "stratus", "user": "stratus" }
            }],
            "current-context": "stratus",
        });
        serde_json::from_value(doc)
            .map_err(|e| Error::provider(format!("failed to build kubeconfig: {}", e)))
    }
}

impl From<&RuntimeHandle> for KubeConnection {
    fn from(handle: &RuntimeHandle) -> Self {
        KubeConnection {
            api_endpoint: handle.api_endpoint.clone(),
            ca_certificate: handle.ca_certificate.clone(),
            credential: match &handle.credential {
                RuntimeCredential::Certificate { cert, key } => StoredCredential::Certificate {
                    cert: cert.clone(),
                    key: key.clone(),
                },
                RuntimeCredential::Token { token, expires_at } => StoredCredential::Token {
                    token: token.clone(),
                    expires_at: *expires_at,
                },
            },
        }
    }
}

impl From<&KubeConnection> for RuntimeHandle {
    fn from(conn: &KubeConnection) -> Self {
        RuntimeHandle {
            api_endpoint: conn.api_endpoint.clone(),
            ca_certificate: conn.ca_certificate.clone(),
            credential: match &conn.credential {
                StoredCredential::Certificate { cert, key } => RuntimeCredential::Certificate {
                    cert: cert.clone(),
                    key: key.clone(),
                },
                StoredCredential::Token { token, expires_at } => RuntimeCredential::Token {
                    token: token.clone(),
                    expires_at: *expires_at,
                },
            },
        }
    }
}

/// Infrastructure provider for one Kubernetes runtime substrate
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InfrastructureProvider: Send + Sync {
    /// Create the runtime. Managed variants stream progress and inventory
    /// entries while this call blocks.
    async fn create(&self) -> Result<RuntimeHandle>;

    /// Delete the runtime and everything listed in its inventory. Safe to
    /// call against a partial creation.
    async fn delete(&self) -> Result<()>;

    /// Connection information for an already-existing runtime
    async fn get_connection(&self) -> Result<RuntimeHandle>;

    /// Re-issue the connection credential. For token-based substrates this
    /// mints a fresh token; for static-certificate substrates it is the same
    /// as [`InfrastructureProvider::get_connection`].
    async fn refresh_connection(&self) -> Result<RuntimeHandle>;
}

/// Return a handle that is safe to build a Kubernetes client from,
/// refreshing the connection first if the credential is expired.
///
/// An expired token is a recoverable condition, never fatal.
pub async fn ensure_fresh(
    provider: &dyn InfrastructureProvider,
    handle: RuntimeHandle,
) -> Result<RuntimeHandle> {
    if handle.is_expired() {
        tracing::info!("Runtime credential expired, refreshing connection");
        provider.refresh_connection().await
    } else {
        Ok(handle)
    }
}

/// Build a Kubernetes client from a runtime handle.
///
/// Callers holding a possibly-stale handle go through [`ensure_fresh`] first.
pub async fn kube_client(handle: &RuntimeHandle) -> Result<kube::Client> {
    let kubeconfig = handle.to_kubeconfig()?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::provider(format!("failed to build kube config: {}", e)))?;
    kube::Client::try_from(config).map_err(Error::from)
}

/// Everything needed to construct a provider for one instance
pub struct ProviderSettings {
    /// Instance name (flows into runtime and cloud resource names)
    pub instance: String,
    /// Number of worker nodes
    pub worker_nodes: u32,
    /// Provider-specific addressing (required for cloud variants)
    pub config: Option<ProviderConfig>,
    /// Path of the instance's inventory file (cloud variants)
    pub inventory_path: std::path::PathBuf,
    /// Progress/inventory channels, wired before `create` is called
    pub streams: Option<ProviderStreams>,
}

/// Create a provider instance for the given provider kind
pub fn create_provider(
    kind: ProviderKind,
    settings: ProviderSettings,
) -> Result<Box<dyn InfrastructureProvider>> {
    match kind {
        ProviderKind::Local => Ok(Box::new(LocalProvider::new(
            settings.instance,
            settings.worker_nodes,
        ))),
        ProviderKind::Eks => {
            let (region, profile) = match settings.config {
                Some(ProviderConfig::Eks {
                    region, profile, ..
                }) => (region, profile),
                _ => {
                    return Err(Error::validation(
                        "eks provider requires region and profile configuration",
                    ))
                }
            };
            Ok(Box::new(EksProvider::new(
                settings.instance,
                region,
                profile,
                settings.worker_nodes,
                settings.inventory_path,
                settings.streams,
            )))
        }
        ProviderKind::Aks => {
            let (location, resource_group, subscription) = match settings.config {
                Some(ProviderConfig::Aks {
                    location,
                    resource_group,
                    subscription,
                    ..
                }) => (location, resource_group, subscription),
                _ => {
                    return Err(Error::validation(
                        "aks provider requires location, resource group and subscription",
                    ))
                }
            };
            Ok(Box::new(AksProvider::new(
                settings.instance,
                location,
                resource_group,
                subscription,
                settings.worker_nodes,
                settings.inventory_path,
                settings.streams,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert_handle() -> RuntimeHandle {
        RuntimeHandle {
            api_endpoint: "https://127.0.0.1:6443".to_string(),
            ca_certificate: "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n"
                .to_string(),
            credential: RuntimeCredential::Certificate {
                cert: "cert-pem".to_string(),
                key: "key-pem".to_string(),
            },
        }
    }

    fn token_handle(expires_in_secs: i64) -> RuntimeHandle {
        RuntimeHandle {
            api_endpoint: "https://10.0.0.1:443".to_string(),
            ca_certificate: "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n"
                .to_string(),
            credential: RuntimeCredential::Token {
                token: "k8s-aws-v1.token".to_string(),
                expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
            },
        }
    }

    #[test]
    fn certificate_credentials_never_expire() {
        assert!(!cert_handle().is_expired());
    }

    #[test]
    fn token_expiry_includes_safety_skew() {
        assert!(!token_handle(600).is_expired());
        // Inside the 60s skew window counts as expired
        assert!(token_handle(30).is_expired());
        assert!(token_handle(-10).is_expired());
    }

    #[tokio::test]
    async fn ensure_fresh_refreshes_expired_tokens() {
        let mut provider = MockInfrastructureProvider::new();
        let fresh = token_handle(900);
        let fresh_clone = fresh.clone();
        provider
            .expect_refresh_connection()
            .times(1)
            .returning(move || Ok(fresh_clone.clone()));

        let out = ensure_fresh(&provider, token_handle(-5)).await.unwrap();
        assert_eq!(out, fresh);
    }

    #[tokio::test]
    async fn ensure_fresh_passes_live_handles_through() {
        let mut provider = MockInfrastructureProvider::new();
        provider.expect_refresh_connection().times(0);

        let handle = token_handle(600);
        let out = ensure_fresh(&provider, handle.clone()).await.unwrap();
        assert_eq!(out, handle);
    }

    #[test]
    fn kubeconfig_built_for_both_credential_kinds() {
        let kc = cert_handle().to_kubeconfig().unwrap();
        assert_eq!(kc.clusters.len(), 1);
        assert_eq!(
            kc.clusters[0].cluster.as_ref().unwrap().server.as_deref(),
            Some("https://127.0.0.1:6443")
        );
        let user = kc.auth_infos[0].auth_info.as_ref().unwrap();
        assert!(user.client_certificate_data.is_some());
        assert!(user.token.is_none());

        let kc = token_handle(600).to_kubeconfig().unwrap();
        let user = kc.auth_infos[0].auth_info.as_ref().unwrap();
        assert!(user.token.is_some());
        assert!(user.client_certificate_data.is_none());
    }

    #[test]
    fn handle_roundtrips_through_stored_connection() {
        let handle = token_handle(600);
        let stored = KubeConnection::from(&handle);
        let back = RuntimeHandle::from(&stored);
        assert_eq!(back, handle);
    }

    #[test]
    fn cloud_provider_requires_its_config() {
        let settings = ProviderSettings {
            instance: "dev".to_string(),
            worker_nodes: 2,
            config: None,
            inventory_path: std::path::PathBuf::from("/tmp/inventory-dev.json"),
            streams: None,
        };
        let result = create_provider(ProviderKind::Eks, settings);
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
