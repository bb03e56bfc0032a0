//! Teardown: the compensator and the deletion workflow
//!
//! The compensation context accumulates references to everything a
//! provisioning run has created so far. On any step failure, or on an
//! operator interrupt, [`compensate`] consumes it and tears everything down
//! in reverse creation order. Teardown is best-effort: a failed step is
//! recorded and the remaining steps still run, and the operator is told when
//! manual inspection of the cloud account is required.
//!
//! The same reverse order backs the explicit `delete` command, with one
//! addition: a genesis instance is only deleted after its API confirms that
//! nothing depends on it.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::{Api, DeleteParams, ListParams};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{ControlPlaneInstance, InstanceRegistry, ProviderConfig};
use crate::identity::{AwsIdentityClient, IdentityManager};
use crate::inventory::remove_inventory;
use crate::provider::{ensure_fresh, kube_client, InfrastructureProvider, RuntimeHandle};
use crate::registration::{DependentCounts, RegistrationClient};
use crate::{Error, Result, INVENTORY_FLUSH_GRACE};

/// Everything a provisioning run has created so far, in creation order.
///
/// Shared between the main workflow and the interrupt listener behind one
/// exclusive lock ([`SharedContext`]); whichever side reaches [`compensate`]
/// first holds the lock for the whole teardown, so the other side can never
/// observe a half-populated context.
#[derive(Default)]
pub struct CompensationContext {
    /// The instance record being built
    pub instance: Option<ControlPlaneInstance>,
    /// Registry holding the skeleton record
    pub registry: Option<InstanceRegistry>,
    /// Provider, once infrastructure creation has started
    pub provider: Option<Box<dyn InfrastructureProvider>>,
    /// Identity manager, once identity resources exist
    pub identity: Option<Box<dyn IdentityManager>>,
    /// Kubernetes client for the runtime, once components were applied
    pub kube: Option<kube::Client>,
    /// Whether infrastructure teardown should run. False when only the
    /// control-plane layer was provisioned onto a pre-existing runtime.
    pub teardown_infra: bool,
    /// Operator asked to keep everything on failure
    pub skip_teardown: bool,
    /// Marks the context as already consumed
    compensated: bool,
}

/// The compensation context behind its exclusive lock
pub type SharedContext = Arc<Mutex<CompensationContext>>;

impl CompensationContext {
    /// Fresh context for a provisioning run
    pub fn new(skip_teardown: bool) -> SharedContext {
        Arc::new(Mutex::new(Self {
            skip_teardown,
            ..Default::default()
        }))
    }
}

/// Tear down everything the context references, in reverse creation order.
///
/// Returns `Ok` when every applicable step succeeded (or was skipped as
/// already-gone); a [`Error::Teardown`] listing every failed step otherwise.
/// The triggering error is logged, never swallowed - callers report both.
pub async fn compensate(ctx: &mut CompensationContext, cause: &Error) -> Result<()> {
    if ctx.compensated {
        return Ok(());
    }
    ctx.compensated = true;

    error!(error = %cause, "Provisioning failed, compensating");

    if ctx.skip_teardown {
        warn!("Teardown skipped on request; created resources and the registry record persist");
        return Ok(());
    }

    let name = ctx
        .instance
        .as_ref()
        .map(|i| i.name.clone())
        .unwrap_or_default();
    let mut failures: Vec<String> = Vec::new();

    // In-cluster components first, so cloud load balancers are released
    // before the network underneath them is deleted
    if let (Some(client), Some(instance)) = (&ctx.kube, &ctx.instance) {
        info!(instance = %name, "Removing control-plane components");
        if let Err(e) = remove_components(client.clone(), &instance.namespace).await {
            warn!(error = %e, "Failed to remove control-plane components");
            failures.push(format!("components: {}", e));
        }
    }

    if ctx.teardown_infra {
        if let Some(provider) = &ctx.provider {
            // Give the inventory drain a moment to flush in-flight entries
            tokio::time::sleep(INVENTORY_FLUSH_GRACE).await;
            info!(instance = %name, "Deleting infrastructure");
            if let Err(e) = provider.delete().await {
                warn!(error = %e, "Failed to delete infrastructure");
                failures.push(format!("infrastructure: {}", e));
            }
        }
    }

    if let Some(identity) = &ctx.identity {
        info!(instance = %name, "Removing identity resources");
        if let Err(e) = identity.teardown(&name).await {
            warn!(error = %e, "Failed to remove identity resources");
            failures.push(format!("identity: {}", e));
        }
    }

    if let Some(registry) = &ctx.registry {
        if let Err(e) = remove_inventory(&registry.inventory_path(&name)) {
            failures.push(format!("inventory: {}", e));
        }
        info!(instance = %name, "Removing registry record");
        if let Err(e) = registry.remove(&name) {
            warn!(error = %e, "Failed to remove registry record");
            failures.push(format!("registry: {}", e));
        }
    }

    if failures.is_empty() {
        info!(instance = %name, "Compensation complete");
        Ok(())
    } else {
        error!(
            instance = %name,
            "Compensation incomplete; manual inspection of the cloud account may be required"
        );
        Err(Error::teardown(failures.join("; ")))
    }
}

/// Refuse deletion of a genesis instance while anything still depends on it.
/// Pure check over already-fetched counts, so the rejection happens before
/// any remote deletion call.
pub fn ensure_no_dependents(name: &str, counts: DependentCounts) -> Result<()> {
    if counts.is_empty() {
        Ok(())
    } else {
        Err(Error::state_conflict(format!(
            "instance '{}' still has {} dependent control plane(s) and {} workload(s); delete them first",
            name, counts.control_planes, counts.workloads
        )))
    }
}

/// True when a Kubernetes call was rejected for a stale credential
fn is_unauthorized(err: &Error) -> bool {
    match err {
        Error::Kube(kube::Error::Api(ae)) => ae.code == 401,
        other => other.to_string().contains("Unauthorized"),
    }
}

/// Delete the in-cluster control-plane components: load-balancer services
/// first, then the namespace. Already-gone resources are skipped.
async fn remove_components(client: kube::Client, namespace: &str) -> Result<()> {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    match services.list(&ListParams::default()).await {
        Ok(list) => {
            for svc in list.items {
                let is_lb = svc
                    .spec
                    .as_ref()
                    .and_then(|s| s.type_.as_deref())
                    .map(|t| t == "LoadBalancer")
                    .unwrap_or(false);
                if !is_lb {
                    continue;
                }
                let svc_name = svc.metadata.name.clone().unwrap_or_default();
                info!(service = %svc_name, "Deleting load balancer service");
                if let Err(e) = services.delete(&svc_name, &DeleteParams::default()).await {
                    if !is_kube_not_found(&e) {
                        return Err(Error::from(e));
                    }
                }
            }
        }
        Err(e) if is_kube_not_found(&e) => {}
        Err(e) => return Err(Error::from(e)),
    }

    let namespaces: Api<Namespace> = Api::all(client);
    match namespaces.delete(namespace, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_kube_not_found(&e) => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}

fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Options for the explicit deletion workflow
pub struct DeleteOptions {
    /// Instance to delete
    pub name: String,
    /// Proceed past registry conflicts (e.g. an instance that is not
    /// recorded). Dependent checks are never bypassed.
    pub force: bool,
}

/// The explicit `delete` workflow: dependent checks, component removal,
/// inventory-driven infrastructure deletion, identity teardown, registry
/// cleanup - mirroring creation in reverse.
pub struct Deleter {
    registry: InstanceRegistry,
}

impl Deleter {
    /// Build a deleter over the given registry
    pub fn new(registry: InstanceRegistry) -> Self {
        Self { registry }
    }

    /// Run the deletion workflow for one instance
    pub async fn delete(&self, options: &DeleteOptions) -> Result<()> {
        let name = &options.name;
        if !self.registry.exists(name)? {
            if options.force {
                warn!(instance = %name, "Instance not recorded; nothing to delete");
                return Ok(());
            }
            return Err(Error::state_conflict(format!(
                "instance '{}' not found (use force to ignore)",
                name
            )));
        }
        let instance = self.registry.get(name)?;

        // Genesis protection: ask the instance's own API what depends on it
        // before touching anything
        if instance.genesis {
            if let Some(api_server) = &instance.api_server {
                let api = RegistrationClient::new(api_server.clone());
                let counts = api.count_dependents(name).await.unwrap_or_else(|e| {
                    // An unreachable API cannot have live dependents worth
                    // protecting; log and continue
                    warn!(error = %e, "Could not query dependents; assuming none");
                    DependentCounts::default()
                });
                ensure_no_dependents(name, counts)?;
            }
        }

        let provider = crate::provider::create_provider(
            instance.provider,
            crate::provider::ProviderSettings {
                instance: name.clone(),
                worker_nodes: 0,
                config: instance.provider_config.clone(),
                inventory_path: self.registry.inventory_path(name),
                streams: None,
            },
        )?;

        // Component removal wants a live client; a stale token gets exactly
        // one refresh-and-retry
        if let Some(conn) = &instance.kube {
            let handle = RuntimeHandle::from(conn);
            match self.remove_components_fresh(provider.as_ref(), handle, &instance).await {
                Ok(()) => {}
                Err(e) if is_unauthorized(&e) => {
                    info!("Kubernetes rejected the credential, refreshing and retrying once");
                    let handle = provider.refresh_connection().await?;
                    self.remove_components_fresh(provider.as_ref(), handle, &instance)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(instance = %name, "Deleting infrastructure");
        provider.delete().await?;

        // Only the AWS variant creates out-of-band identity resources; the
        // AKS cluster's AAD identity goes away with its resource group
        if let Some(ProviderConfig::Eks {
            region, profile, ..
        }) = &instance.provider_config
        {
            let identity = AwsIdentityClient::new(profile.clone(), region.clone());
            identity.teardown(name).await?;
        }

        remove_inventory(&self.registry.inventory_path(name))?;
        self.registry.remove(name)?;
        info!(instance = %name, "Instance deleted");
        Ok(())
    }

    async fn remove_components_fresh(
        &self,
        provider: &dyn InfrastructureProvider,
        handle: RuntimeHandle,
        instance: &ControlPlaneInstance,
    ) -> Result<()> {
        let handle = ensure_fresh(provider, handle).await?;
        let client = kube_client(&handle).await?;
        remove_components(client, &instance.namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, ProvisionState};
    use crate::identity::MockIdentityManager;
    use crate::provider::MockInfrastructureProvider;
    use tempfile::TempDir;

    fn registry() -> (TempDir, InstanceRegistry) {
        let dir = TempDir::new().expect("tempdir");
        let reg = InstanceRegistry::open_in(dir.path()).expect("open registry");
        (dir, reg)
    }

    fn instance(name: &str) -> ControlPlaneInstance {
        ControlPlaneInstance {
            name: name.to_string(),
            provider: ProviderKind::Eks,
            genesis: true,
            namespace: crate::DEFAULT_NAMESPACE.to_string(),
            state: ProvisionState::InfraReady,
            ..Default::default()
        }
    }

    #[test]
    fn dependent_check_is_pure_and_strict() {
        assert!(ensure_no_dependents("dev", DependentCounts::default()).is_ok());

        let err = ensure_no_dependents(
            "dev",
            DependentCounts {
                control_planes: 1,
                workloads: 0,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)));

        let err = ensure_no_dependents(
            "dev",
            DependentCounts {
                control_planes: 0,
                workloads: 3,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)));
    }

    #[tokio::test]
    async fn skip_teardown_leaves_everything_intact() {
        let (_dir, reg) = registry();
        reg.insert(instance("dev"), false).unwrap();

        let mut provider = MockInfrastructureProvider::new();
        provider.expect_delete().times(0);
        let mut identity = MockIdentityManager::new();
        identity.expect_teardown().times(0);

        let mut ctx = CompensationContext {
            instance: Some(instance("dev")),
            registry: Some(reg.clone()),
            provider: Some(Box::new(provider)),
            identity: Some(Box::new(identity)),
            teardown_infra: true,
            skip_teardown: true,
            ..Default::default()
        };

        compensate(&mut ctx, &Error::provisioning("install_components", "boom"))
            .await
            .unwrap();

        // Record persists for manual inspection
        assert!(reg.exists("dev").unwrap());
    }

    #[tokio::test]
    async fn full_compensation_reverses_creation() {
        let (_dir, reg) = registry();
        reg.insert(instance("dev"), false).unwrap();
        let inventory_path = reg.inventory_path("dev");
        crate::inventory::ResourceInventory {
            instance: "dev".to_string(),
            entries: vec![],
        }
        .save(&inventory_path)
        .unwrap();

        let mut provider = MockInfrastructureProvider::new();
        provider.expect_delete().times(1).returning(|| Ok(()));
        let mut identity = MockIdentityManager::new();
        identity
            .expect_teardown()
            .times(1)
            .returning(|_| Ok(()));

        let mut ctx = CompensationContext {
            instance: Some(instance("dev")),
            registry: Some(reg.clone()),
            provider: Some(Box::new(provider)),
            identity: Some(Box::new(identity)),
            teardown_infra: true,
            ..Default::default()
        };

        compensate(&mut ctx, &Error::provisioning("wait_for_api", "timeout"))
            .await
            .unwrap();

        assert!(!reg.exists("dev").unwrap());
        assert!(!inventory_path.exists());
    }

    #[tokio::test]
    async fn compensation_continues_past_failed_steps() {
        let (_dir, reg) = registry();
        reg.insert(instance("dev"), false).unwrap();

        let mut provider = MockInfrastructureProvider::new();
        provider
            .expect_delete()
            .times(1)
            .returning(|| Err(Error::provider("vpc delete failed")));
        let mut identity = MockIdentityManager::new();
        identity
            .expect_teardown()
            .times(1)
            .returning(|_| Ok(()));

        let mut ctx = CompensationContext {
            instance: Some(instance("dev")),
            registry: Some(reg.clone()),
            provider: Some(Box::new(provider)),
            identity: Some(Box::new(identity)),
            teardown_infra: true,
            ..Default::default()
        };

        let err = compensate(&mut ctx, &Error::provisioning("install_components", "boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Teardown(_)));
        assert!(err.to_string().contains("infrastructure"));

        // Later steps still ran: the registry record is gone
        assert!(!reg.exists("dev").unwrap());
    }

    #[tokio::test]
    async fn compensation_runs_at_most_once() {
        let mut provider = MockInfrastructureProvider::new();
        provider.expect_delete().times(1).returning(|| Ok(()));

        let mut ctx = CompensationContext {
            instance: Some(instance("dev")),
            provider: Some(Box::new(provider)),
            teardown_infra: true,
            ..Default::default()
        };

        let cause = Error::provisioning("create_infrastructure", "boom");
        compensate(&mut ctx, &cause).await.unwrap();
        // Interrupt listener arriving second sees a consumed context
        compensate(&mut ctx, &cause).await.unwrap();
    }

    #[tokio::test]
    async fn control_plane_only_skips_infra_teardown() {
        let mut provider = MockInfrastructureProvider::new();
        provider.expect_delete().times(0);

        let mut ctx = CompensationContext {
            instance: Some(instance("dev")),
            provider: Some(Box::new(provider)),
            teardown_infra: false,
            ..Default::default()
        };

        compensate(&mut ctx, &Error::provisioning("install_components", "boom"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_missing_instance_needs_force() {
        let (_dir, reg) = registry();
        let deleter = Deleter::new(reg);

        let err = deleter
            .delete(&DeleteOptions {
                name: "ghost".to_string(),
                force: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)));

        deleter
            .delete(&DeleteOptions {
                name: "ghost".to_string(),
                force: true,
            })
            .await
            .unwrap();
    }

    #[test]
    fn unauthorized_classification() {
        assert!(is_unauthorized(&Error::provider(
            "the server reported Unauthorized"
        )));
        assert!(!is_unauthorized(&Error::provider("connection refused")));
    }
}
