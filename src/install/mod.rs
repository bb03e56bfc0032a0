//! Provisioning orchestrator
//!
//! The creation workflow for one control-plane instance:
//!
//! 1. Validate operator input and write the skeleton registry record
//! 2. Create cloud identity resources (managed variants)
//! 3. Create the Kubernetes runtime, streaming progress and inventory
//! 4. Generate secrets: encryption key, CA, client certificates, database credentials
//! 5. Install the control-plane components onto the runtime
//! 6. Wait for the API server to answer its readiness probe
//! 7. Install authentication (optional), controllers, and the in-cluster agent
//! 8. Register the runtime, the account, and the control plane through its own API
//!
//! The ordering is load-bearing: identity before infrastructure, infrastructure
//! before any Kubernetes object, dependencies before the API server, API
//! reachability before controllers and the agent, and self-registration last.
//!
//! Every step that creates something registers its inverse with the
//! compensation context before the next step runs. Any failure (or an
//! operator interrupt) routes through [`crate::uninstall::compensate`], which
//! consumes that context.

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{
    ControlPlaneInstance, InstanceRegistry, KubeConnection, ProviderConfig, ProviderKind,
    ProvisionState,
};
use crate::identity::AwsIdentityClient;
use crate::inventory::{
    join_drain, spawn_inventory_writer, spawn_progress_logger, ProviderStreams, ResourceInventory,
};
use crate::pki::{self, CertificateAuthority};
use crate::provider::{
    create_provider, ensure_fresh, kube_client, InfrastructureProvider, ProviderSettings,
    RuntimeHandle,
};
use crate::registration::{ComponentVersion, ProviderMetadata, RegistrationClient};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::uninstall::{compensate, CompensationContext, SharedContext};
use crate::{
    Error, Result, API_READY_ATTEMPTS, API_READY_DELAY, DEFAULT_API_PORT, DEFAULT_NAMESPACE,
    FIELD_MANAGER, MAX_INSTANCE_NAME_LEN,
};

/// Version stamped on every installed component
const COMPONENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Operator input for one provisioning run
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Instance name (unique, length-bounded, DNS-safe)
    pub name: String,
    /// Infrastructure substrate
    pub provider: ProviderKind,
    /// Provider-specific addressing (required for cloud variants)
    pub provider_config: Option<ProviderConfig>,
    /// First, self-hosting instance
    pub genesis: bool,
    /// Install authentication components
    pub auth_enabled: bool,
    /// Root domain for TLS alt-names and the public API endpoint
    pub root_domain: Option<String>,
    /// Worker node count
    pub worker_nodes: u32,
    /// Install onto a pre-existing runtime; skip infrastructure creation
    pub control_plane_only: bool,
    /// Create the runtime only; skip component installation
    pub infra_only: bool,
    /// Keep everything in place if provisioning fails
    pub skip_teardown: bool,
    /// Replace an existing registry record with the same name
    pub force_overwrite: bool,
    /// Namespace the components go into
    pub namespace: String,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: ProviderKind::Local,
            provider_config: None,
            genesis: true,
            auth_enabled: false,
            root_domain: None,
            worker_nodes: 1,
            control_plane_only: false,
            infra_only: false,
            skip_teardown: false,
            force_overwrite: false,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

/// Reject bad operator input before anything is created
fn validate(options: &CreateOptions) -> Result<()> {
    if options.name.is_empty() {
        return Err(Error::validation("instance name must not be empty"));
    }
    if options.name.len() > MAX_INSTANCE_NAME_LEN {
        return Err(Error::validation(format!(
            "instance name '{}' exceeds {} characters",
            options.name, MAX_INSTANCE_NAME_LEN
        )));
    }
    if !options
        .name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::validation(format!(
            "instance name '{}' may only contain lowercase letters, digits and dashes",
            options.name
        )));
    }
    if options.control_plane_only && options.infra_only {
        return Err(Error::validation(
            "control-plane-only and infra-only are mutually exclusive",
        ));
    }
    if options.provider != ProviderKind::Local && options.provider_config.is_none() {
        return Err(Error::validation(format!(
            "provider '{}' requires provider configuration",
            options.provider
        )));
    }
    match (&options.provider, &options.provider_config) {
        (ProviderKind::Eks, Some(ProviderConfig::Aks { .. }))
        | (ProviderKind::Aks, Some(ProviderConfig::Eks { .. })) => Err(Error::validation(
            "provider configuration does not match the selected provider",
        )),
        _ => Ok(()),
    }
}

/// Constructs the provider for a given substrate. Injected so tests can
/// substitute mock providers and fail individual workflow steps.
pub type ProviderFactory =
    Box<dyn Fn(ProviderKind, ProviderSettings) -> Result<Box<dyn InfrastructureProvider>> + Send + Sync>;

/// The ordered creation workflow driver
pub struct Orchestrator {
    registry: InstanceRegistry,
    provider_factory: ProviderFactory,
}

impl Orchestrator {
    /// Build an orchestrator over the given registry
    pub fn new(registry: InstanceRegistry) -> Self {
        Self::with_provider_factory(registry, Box::new(create_provider))
    }

    /// Build an orchestrator with a custom provider factory
    pub fn with_provider_factory(registry: InstanceRegistry, provider_factory: ProviderFactory) -> Self {
        Self {
            registry,
            provider_factory,
        }
    }

    /// Run the full provisioning workflow. On failure the compensation
    /// context is consumed and both the original and any teardown error are
    /// surfaced together.
    pub async fn create(&self, options: CreateOptions) -> Result<()> {
        validate(&options)?;

        let ctx = CompensationContext::new(options.skip_teardown);
        let listener = spawn_interrupt_listener(ctx.clone());

        let result = self.run(&options, &ctx).await;
        listener.abort();

        match result {
            Ok(()) => {
                info!(instance = %options.name, "Provisioning complete");
                Ok(())
            }
            Err(e) => {
                let mut guard = ctx.lock().await;
                match compensate(&mut guard, &e).await {
                    Ok(()) => Err(e),
                    // Both errors reach the operator, neither is swallowed
                    Err(teardown) => Err(Error::teardown(format!("{}; {}", e, teardown))),
                }
            }
        }
    }

    async fn run(&self, options: &CreateOptions, ctx: &SharedContext) -> Result<()> {
        // Step 1: skeleton record. From here on a failure must clean it up.
        let instance = ControlPlaneInstance {
            name: options.name.clone(),
            provider: options.provider,
            genesis: options.genesis,
            namespace: options.namespace.clone(),
            auth_enabled: options.auth_enabled,
            state: ProvisionState::Init,
            provider_config: options.provider_config.clone(),
            ..Default::default()
        };
        {
            // The context learns about the record under the same lock the
            // interrupt listener takes, so no instant exists where the record
            // is on disk but unknown to compensation
            let mut guard = ctx.lock().await;
            self.registry
                .insert(instance.clone(), options.force_overwrite)?;
            guard.instance = Some(instance.clone());
            guard.registry = Some(self.registry.clone());
            guard.teardown_infra = !options.control_plane_only;
        }
        self.registry.set_current(&options.name)?;

        // Step 2: cloud identity resources before any infrastructure
        let access_key = if options.provider == ProviderKind::Eks && !options.control_plane_only {
            Some(
                self.create_identity(options, ctx)
                    .await
                    .map_err(|e| Error::provisioning("create_identity", e))?,
            )
        } else {
            None
        };

        // Step 3: the runtime itself
        let handle = if options.control_plane_only {
            self.connect_existing(options, ctx)
                .await
                .map_err(|e| Error::provisioning("connect_runtime", e))?
        } else {
            self.create_infrastructure(options, ctx)
                .await
                .map_err(|e| Error::provisioning("create_infrastructure", e))?
        };
        if options.infra_only {
            info!(instance = %options.name, "Infrastructure ready; skipping component installation");
            return Ok(());
        }

        // Step 4: secrets
        let secrets = self
            .generate_secrets(options)
            .map_err(|e| Error::provisioning("generate_secrets", e))?;
        self.registry.upsert(&options.name, |i| {
            i.encryption_key = Some(secrets.encryption_key.clone());
            i.ca_certificate = Some(secrets.ca_cert_pem.clone());
            i.client_certificate = Some(secrets.client_cert_pem.clone());
            i.client_key = Some(secrets.client_key_pem.clone());
            i.state = ProvisionState::SecretsReady;
        })?;

        // Step 5: components. The handle may have aged while infrastructure
        // was created, so refresh before building the client.
        let client = {
            let guard = ctx.lock().await;
            let provider = guard
                .provider
                .as_ref()
                .ok_or_else(|| Error::provisioning("install_components", "provider missing"))?;
            let fresh = ensure_fresh(provider.as_ref(), handle.clone())
                .await
                .map_err(|e| Error::provisioning("refresh_connection", e))?;
            kube_client(&fresh)
                .await
                .map_err(|e| Error::provisioning("install_components", e))?
        };
        {
            let mut guard = ctx.lock().await;
            guard.kube = Some(client.clone());
        }
        self.install_components(&client, options, &secrets, access_key.as_ref())
            .await
            .map_err(|e| Error::provisioning("install_components", e))?;
        self.registry.upsert(&options.name, |i| {
            i.state = ProvisionState::ComponentsInstalled;
        })?;

        // Step 6: readiness. Cloud instances without a root domain are only
        // reachable through the load balancer the API service provisions, so
        // its ingress has to exist before anything can be probed.
        let api_server = match static_api_endpoint(options, &handle) {
            Some(endpoint) => endpoint,
            None => {
                let host = load_balancer_endpoint(&client, &options.namespace)
                    .await
                    .map_err(|e| Error::provisioning("wait_for_load_balancer", e))?;
                format!("http://{}:{}", host, DEFAULT_API_PORT)
            }
        };
        self.registry.upsert(&options.name, |i| {
            i.api_server = Some(api_server.clone());
        })?;
        wait_for_api(&api_server, &secrets.ca_cert_pem).await?;
        self.registry.upsert(&options.name, |i| {
            i.state = ProvisionState::ApiReachable;
        })?;

        // Step 7: optional auth, then controllers and the agent
        if options.auth_enabled {
            self.install_deployment(&client, options, "stratus-auth")
                .await
                .map_err(|e| Error::provisioning("install_auth", e))?;
            self.registry.upsert(&options.name, |i| {
                i.state = ProvisionState::AuthInstalled;
            })?;
        }
        self.install_deployment(&client, options, "stratus-controllers")
            .await
            .map_err(|e| Error::provisioning("install_controllers", e))?;
        self.registry.upsert(&options.name, |i| {
            i.state = ProvisionState::ControllersInstalled;
        })?;
        self.install_deployment(&client, options, "stratus-agent")
            .await
            .map_err(|e| Error::provisioning("install_agent", e))?;
        self.registry.upsert(&options.name, |i| {
            i.state = ProvisionState::AgentInstalled;
        })?;

        // Step 8: the instance records itself through its own API
        self.self_register(options, &api_server)
            .await
            .map_err(|e| Error::provisioning("self_registration", e))?;
        self.registry.upsert(&options.name, |i| {
            i.state = ProvisionState::SelfRegistered;
        })?;

        self.registry.upsert(&options.name, |i| {
            i.state = ProvisionState::Complete;
        })?;
        Ok(())
    }

    /// Create the cloud roles, policy and service account the managed runtime
    /// needs, returning the service account's access key so it can be handed
    /// to the components. The identity teardown inverse goes into the context
    /// as soon as the first resource exists.
    async fn create_identity(
        &self,
        options: &CreateOptions,
        ctx: &SharedContext,
    ) -> Result<crate::identity::AccessKey> {
        let (region, profile) = match &options.provider_config {
            Some(ProviderConfig::Eks {
                region, profile, ..
            }) => (region.clone(), profile.clone()),
            _ => return Err(Error::validation("eks identity requires region and profile")),
        };
        let client = AwsIdentityClient::new(profile, region);

        client.create_resource_manager_role(&options.name).await?;
        {
            let mut guard = ctx.lock().await;
            guard.identity = Some(Box::new(client.clone()));
        }
        client.create_runtime_management_role(&options.name).await?;
        client.create_runtime_policy(&options.name).await?;
        let access_key = client.create_service_account(&options.name).await?;

        let account_id = client.account_id().await?;
        self.registry.upsert(&options.name, |i| {
            if let Some(ProviderConfig::Eks { account_id: a, .. }) = &mut i.provider_config {
                *a = Some(account_id.clone());
            }
        })?;
        Ok(access_key)
    }

    /// Create the runtime, with the progress and inventory drains running for
    /// the whole duration of the blocking create call.
    async fn create_infrastructure(
        &self,
        options: &CreateOptions,
        ctx: &SharedContext,
    ) -> Result<RuntimeHandle> {
        let inventory_path = self.registry.inventory_path(&options.name);

        // The context gets its own (stream-less) provider before creation
        // starts, so an interrupt mid-create can already tear down
        let for_ctx = self.build_provider(options, None)?;
        {
            let mut guard = ctx.lock().await;
            guard.provider = Some(for_ctx);
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (inventory_tx, inventory_rx) = mpsc::unbounded_channel();
        let progress_drain = spawn_progress_logger(progress_rx);
        let inventory_drain =
            spawn_inventory_writer(inventory_path, options.name.clone(), inventory_rx);

        let provider = self.build_provider(
            options,
            Some(ProviderStreams {
                progress: progress_tx,
                inventory: inventory_tx,
            }),
        )?;
        let result = provider.create().await;

        // Dropping the provider closes both senders; the drains then finish
        // and must be joined before the inventory is trusted
        drop(provider);
        if let Err(e) = join_drain(inventory_drain).await {
            if result.is_ok() {
                return Err(e);
            }
            // The provider's own error is the one the operator needs
            warn!(error = %e, "Inventory drain failed after provider error");
        }
        if let Err(e) = progress_drain.await {
            warn!(error = %e, "Progress drain task did not complete cleanly");
        }

        let handle = result?;
        self.registry.upsert(&options.name, |i| {
            i.kube = Some(KubeConnection::from(&handle));
            i.state = ProvisionState::InfraReady;
        })?;
        Ok(handle)
    }

    /// Connect to a pre-existing runtime (control-plane-only installs)
    async fn connect_existing(
        &self,
        options: &CreateOptions,
        ctx: &SharedContext,
    ) -> Result<RuntimeHandle> {
        let provider = self.build_provider(options, None)?;
        let handle = provider.get_connection().await?;
        {
            let mut guard = ctx.lock().await;
            guard.provider = Some(provider);
        }
        self.registry.upsert(&options.name, |i| {
            i.kube = Some(KubeConnection::from(&handle));
            i.state = ProvisionState::InfraReady;
        })?;
        Ok(handle)
    }

    fn build_provider(
        &self,
        options: &CreateOptions,
        streams: Option<ProviderStreams>,
    ) -> Result<Box<dyn InfrastructureProvider>> {
        (self.provider_factory)(
            options.provider,
            ProviderSettings {
                instance: options.name.clone(),
                worker_nodes: options.worker_nodes,
                config: options.provider_config.clone(),
                inventory_path: self.registry.inventory_path(&options.name),
                streams,
            },
        )
    }

    fn generate_secrets(&self, options: &CreateOptions) -> Result<GeneratedSecrets> {
        let ca = CertificateAuthority::new(&format!("stratus-{}", options.name))?;

        let mut alt_names = vec![
            format!("stratus-api.{}.svc", options.namespace),
            format!("stratus-api.{}.svc.cluster.local", options.namespace),
            "localhost".to_string(),
        ];
        if let Some(domain) = &options.root_domain {
            alt_names.push(format!("api.{}", domain));
        }
        let client_cert = ca.issue_client_certificate("stratus-api", &alt_names)?;

        Ok(GeneratedSecrets {
            encryption_key: pki::generate_encryption_key(),
            database: pki::generate_database_credentials(),
            ca_cert_pem: ca.ca_cert_pem().to_string(),
            ca_key_pem: ca.ca_key_pem().to_string(),
            client_cert_pem: client_cert.cert_pem,
            client_key_pem: client_cert.key_pem,
        })
    }

    /// Apply the namespace, secrets, database and API server to the runtime
    async fn install_components(
        &self,
        client: &kube::Client,
        options: &CreateOptions,
        secrets: &GeneratedSecrets,
        access_key: Option<&crate::identity::AccessKey>,
    ) -> Result<()> {
        let ns = &options.namespace;
        info!(namespace = %ns, "Installing control-plane components");

        let namespaces: Api<Namespace> = Api::all(client.clone());
        let namespace: Namespace =
            serde_json::from_value(json!({ "metadata": { "name": ns } }))?;
        apply(&namespaces, ns, &namespace).await?;

        let secret_api: Api<Secret> = Api::namespaced(client.clone(), ns);
        let core_secret: Secret = serde_json::from_value(json!({
            "metadata": { "name": "stratus-core", "namespace": ns },
            "stringData": {
                "encryption-key": secrets.encryption_key,
                "ca.crt": secrets.ca_cert_pem,
                "ca.key": secrets.ca_key_pem,
                "tls.crt": secrets.client_cert_pem,
                "tls.key": secrets.client_key_pem,
            }
        }))?;
        apply(&secret_api, "stratus-core", &core_secret).await?;

        let db_secret: Secret = serde_json::from_value(json!({
            "metadata": { "name": "stratus-db", "namespace": ns },
            "stringData": {
                "database": secrets.database.name,
                "username": secrets.database.user,
                "password": secrets.database.password,
            }
        }))?;
        apply(&secret_api, "stratus-db", &db_secret).await?;

        // Cloud service account credential, consumed by the controllers
        if let Some(key) = access_key {
            let secret = cloud_secret(ns, key)?;
            apply(&secret_api, "stratus-cloud", &secret).await?;
        }

        self.install_deployment(client, options, "stratus-db").await?;
        self.install_deployment(client, options, "stratus-api").await?;

        // The API service fronts the deployment; cloud variants get a load
        // balancer, local runtimes a node port on the fixed API port
        let service_type = if options.provider == ProviderKind::Local {
            "NodePort"
        } else {
            "LoadBalancer"
        };
        let mut port = json!({
            "port": DEFAULT_API_PORT,
            "targetPort": DEFAULT_API_PORT,
        });
        if options.provider == ProviderKind::Local {
            // Pinned so kind's host port mapping lines up
            port["nodePort"] = json!(crate::LOCAL_API_NODE_PORT);
        }
        let services: Api<Service> = Api::namespaced(client.clone(), ns);
        let service: Service = serde_json::from_value(json!({
            "metadata": { "name": "stratus-api", "namespace": ns },
            "spec": {
                "type": service_type,
                "selector": { "app": "stratus-api" },
                "ports": [port]
            }
        }))?;
        apply(&services, "stratus-api", &service).await?;
        Ok(())
    }

    async fn install_deployment(
        &self,
        client: &kube::Client,
        options: &CreateOptions,
        name: &str,
    ) -> Result<()> {
        let ns = &options.namespace;
        info!(component = %name, "Installing component");
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), ns);
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "namespace": ns,
                "labels": { "app": name }
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": name } },
                "template": {
                    "metadata": { "labels": { "app": name } },
                    "spec": {
                        "containers": [{
                            "name": name,
                            "image": format!("ghcr.io/stratus/{}:{}", name, COMPONENT_VERSION),
                            "envFrom": [
                                { "secretRef": { "name": "stratus-core" } },
                                { "secretRef": { "name": "stratus-db" } }
                            ]
                        }]
                    }
                }
            }
        }))?;
        apply(&deployments, name, &deployment).await
    }

    /// Record the runtime, account metadata and the control plane itself in
    /// the instance's freshly started API
    async fn self_register(&self, options: &CreateOptions, api_server: &str) -> Result<()> {
        let api = RegistrationClient::new(api_server);
        let instance = self.registry.get(&options.name)?;

        let metadata = provider_metadata(&instance, options.worker_nodes);
        let kube_endpoint = instance
            .kube
            .as_ref()
            .map(|k| k.api_endpoint.clone())
            .unwrap_or_default();
        api.register_runtime(&options.name, &kube_endpoint, &metadata)
            .await?;

        let inventory = ResourceInventory::load(&self.registry.inventory_path(&options.name))?;
        api.register_provider_metadata(&options.name, &metadata, &inventory)
            .await?;

        api.register_control_plane(&options.name, options.genesis, &installed_components(options))
            .await
    }
}

/// Secrets generated once per provisioning run
struct GeneratedSecrets {
    encryption_key: String,
    database: pki::DatabaseCredentials,
    ca_cert_pem: String,
    ca_key_pem: String,
    client_cert_pem: String,
    client_key_pem: String,
}

/// Server-side apply with this binary as the field manager
async fn apply<K>(api: &Api<K>, name: &str, obj: &K) -> Result<()>
where
    K: Resource + Serialize + DeserializeOwned + Clone + Debug,
{
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(obj),
    )
    .await?;
    Ok(())
}

/// Secret carrying the cloud service-account credential
fn cloud_secret(namespace: &str, key: &crate::identity::AccessKey) -> Result<Secret> {
    serde_json::from_value(json!({
        "metadata": { "name": "stratus-cloud", "namespace": namespace },
        "stringData": {
            "access-key-id": key.id,
            "secret-access-key": key.secret,
        }
    }))
    .map_err(Error::from)
}

/// The public API endpoint when it is knowable without asking the runtime.
///
/// A root domain always wins. Local runtimes answer on the host the kind
/// cluster forwarded the API port to. Cloud runtimes without a domain have no
/// static address; their endpoint is whatever the load balancer gets assigned.
fn static_api_endpoint(options: &CreateOptions, handle: &RuntimeHandle) -> Option<String> {
    if let Some(domain) = &options.root_domain {
        return Some(format!("https://api.{}:{}", domain, DEFAULT_API_PORT));
    }
    if options.provider == ProviderKind::Local {
        let host = handle
            .api_endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split(':')
            .next()
            .unwrap_or("localhost");
        return Some(format!("http://{}:{}", host, DEFAULT_API_PORT));
    }
    None
}

/// First ingress address of a load balancer service, hostname preferred
fn ingress_endpoint(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()
        .and_then(|i| i.hostname.clone().or_else(|| i.ip.clone()))
}

/// Poll the API service until the cloud load balancer has an address
async fn load_balancer_endpoint(client: &kube::Client, namespace: &str) -> Result<String> {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let config = RetryConfig::fixed(API_READY_ATTEMPTS, API_READY_DELAY);
    retry_with_backoff(&config, "wait_for_load_balancer", || {
        let services = services.clone();
        async move {
            let service = services.get("stratus-api").await?;
            ingress_endpoint(&service)
                .ok_or_else(|| Error::provider("load balancer has no ingress address yet"))
        }
    })
    .await
}

/// Poll the API server's readiness endpoint on a fixed interval until it
/// answers or the retry budget runs out.
async fn wait_for_api(api_server: &str, ca_pem: &str) -> Result<()> {
    let mut builder = reqwest::Client::builder();
    if let Ok(cert) = reqwest::Certificate::from_pem(ca_pem.as_bytes()) {
        builder = builder.add_root_certificate(cert);
    }
    let client = builder.build()?;
    let url = format!("{}/readyz", api_server.trim_end_matches('/'));

    info!(url = %url, "Waiting for API server");
    let config = RetryConfig::fixed(API_READY_ATTEMPTS, API_READY_DELAY);
    retry_with_backoff(&config, "wait_for_api", || {
        let client = client.clone();
        let url = url.clone();
        async move {
            client
                .get(&url)
                .send()
                .await?
                .error_for_status()
                .map(|_| ())
                .map_err(Error::from)
        }
    })
    .await
    .map_err(|e| Error::ReadinessTimeout {
        attempts: API_READY_ATTEMPTS,
        message: e.to_string(),
    })
}

/// Components installed by this run, as registered in the API
fn installed_components(options: &CreateOptions) -> Vec<ComponentVersion> {
    let mut names = vec!["stratus-db", "stratus-api", "stratus-controllers", "stratus-agent"];
    if options.auth_enabled {
        names.insert(2, "stratus-auth");
    }
    names
        .into_iter()
        .map(|name| ComponentVersion {
            name: name.to_string(),
            version: COMPONENT_VERSION.to_string(),
        })
        .collect()
}

fn provider_metadata(instance: &ControlPlaneInstance, worker_nodes: u32) -> ProviderMetadata {
    let (account, region) = match &instance.provider_config {
        Some(ProviderConfig::Eks {
            region, account_id, ..
        }) => (account_id.clone(), Some(region.clone())),
        Some(ProviderConfig::Aks {
            location,
            subscription,
            ..
        }) => (Some(subscription.clone()), Some(location.clone())),
        None => (None, None),
    };
    ProviderMetadata {
        provider: instance.provider,
        account,
        region,
        worker_nodes,
    }
}

/// Listen for an operator interrupt and route it through the same
/// compensation path as an ordinary failure. Acquires the context lock
/// before compensating, so it can never observe a half-populated context.
fn spawn_interrupt_listener(ctx: SharedContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, compensating");
        let cause = Error::provisioning("interrupt", "operator interrupt");
        let mut guard = ctx.lock().await;
        let code = match compensate(&mut guard, &cause).await {
            Ok(()) => 130,
            Err(e) => {
                warn!(error = %e, "Compensation after interrupt was incomplete");
                1
            }
        };
        std::process::exit(code);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockInfrastructureProvider;
    use tempfile::TempDir;

    fn options(name: &str) -> CreateOptions {
        CreateOptions {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn validation_rejects_bad_names() {
        assert!(matches!(
            validate(&options("")).unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            validate(&options("Dev_Cluster")).unwrap_err(),
            Error::Validation(_)
        ));
        let long = "a".repeat(MAX_INSTANCE_NAME_LEN + 1);
        assert!(matches!(
            validate(&options(&long)).unwrap_err(),
            Error::Validation(_)
        ));
        validate(&options("dev-1")).unwrap();
    }

    #[test]
    fn validation_rejects_conflicting_partial_flags() {
        let mut opts = options("dev");
        opts.control_plane_only = true;
        opts.infra_only = true;
        assert!(matches!(
            validate(&opts).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn validation_requires_cloud_config() {
        let mut opts = options("dev");
        opts.provider = ProviderKind::Eks;
        assert!(matches!(
            validate(&opts).unwrap_err(),
            Error::Validation(_)
        ));

        opts.provider_config = Some(ProviderConfig::Eks {
            region: "us-east-1".to_string(),
            profile: "default".to_string(),
            account_id: None,
        });
        validate(&opts).unwrap();
    }

    #[test]
    fn validation_rejects_mismatched_provider_config() {
        let mut opts = options("dev");
        opts.provider = ProviderKind::Eks;
        opts.provider_config = Some(ProviderConfig::Aks {
            location: "eastus".to_string(),
            resource_group: "rg".to_string(),
            subscription: "sub".to_string(),
            tenant: None,
        });
        assert!(matches!(
            validate(&opts).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name_before_any_side_effect() {
        let dir = TempDir::new().unwrap();
        let registry = InstanceRegistry::open_in(dir.path()).unwrap();
        registry
            .insert(
                ControlPlaneInstance {
                    name: "dev".to_string(),
                    ..Default::default()
                },
                false,
            )
            .unwrap();

        let orchestrator = Orchestrator::new(registry.clone());
        let err = orchestrator.create(options("dev")).await.unwrap_err();
        assert!(err.is_precondition(), "got: {}", err);
        // The existing record is untouched
        assert!(registry.exists("dev").unwrap());
    }

    fn cert_handle(endpoint: &str) -> RuntimeHandle {
        RuntimeHandle {
            api_endpoint: endpoint.to_string(),
            ca_certificate: "not a certificate".to_string(),
            credential: crate::provider::RuntimeCredential::Certificate {
                cert: "not a cert".to_string(),
                key: "not a key".to_string(),
            },
        }
    }

    #[test]
    fn static_endpoint_prefers_root_domain() {
        let handle = cert_handle("https://10.2.3.4:6443");

        let mut opts = options("dev");
        opts.root_domain = Some("dev.example.com".to_string());
        assert_eq!(
            static_api_endpoint(&opts, &handle).as_deref(),
            Some(format!("https://api.dev.example.com:{}", DEFAULT_API_PORT).as_str())
        );

        // Local without a domain answers on the forwarded host port
        opts.root_domain = None;
        assert_eq!(
            static_api_endpoint(&opts, &handle).as_deref(),
            Some(format!("http://10.2.3.4:{}", DEFAULT_API_PORT).as_str())
        );
    }

    #[test]
    fn cloud_without_domain_has_no_static_endpoint() {
        // The kube-apiserver host is not where the control-plane API listens;
        // the address belongs to the load balancer
        let mut opts = options("dev");
        opts.provider = ProviderKind::Eks;
        opts.provider_config = Some(ProviderConfig::Eks {
            region: "us-east-1".to_string(),
            profile: "default".to_string(),
            account_id: None,
        });
        let handle = cert_handle("https://ABC123.gr7.us-east-1.eks.amazonaws.com");
        assert_eq!(static_api_endpoint(&opts, &handle), None);
    }

    #[test]
    fn ingress_address_prefers_hostname_over_ip() {
        let service: Service = serde_json::from_value(json!({
            "metadata": { "name": "stratus-api" },
            "status": { "loadBalancer": { "ingress": [
                { "hostname": "abc.elb.amazonaws.com", "ip": "52.0.0.1" }
            ]}}
        }))
        .unwrap();
        assert_eq!(
            ingress_endpoint(&service).as_deref(),
            Some("abc.elb.amazonaws.com")
        );

        let service: Service = serde_json::from_value(json!({
            "metadata": { "name": "stratus-api" },
            "status": { "loadBalancer": { "ingress": [{ "ip": "52.0.0.1" }] } }
        }))
        .unwrap();
        assert_eq!(ingress_endpoint(&service).as_deref(), Some("52.0.0.1"));

        // No ingress yet
        assert_eq!(ingress_endpoint(&Service::default()), None);
    }

    #[test]
    fn cloud_secret_carries_both_key_halves() {
        let key = crate::identity::AccessKey {
            id: "AKIAEXAMPLE".to_string(),
            secret: "shhh".to_string(),
        };
        let secret = cloud_secret("stratus-system", &key).unwrap();
        let data = secret.string_data.unwrap();
        assert_eq!(data.get("access-key-id").map(String::as_str), Some("AKIAEXAMPLE"));
        assert_eq!(data.get("secret-access-key").map(String::as_str), Some("shhh"));
    }

    #[test]
    fn auth_component_registered_only_when_enabled() {
        let mut opts = options("dev");
        let names: Vec<_> = installed_components(&opts)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert!(!names.contains(&"stratus-auth".to_string()));

        opts.auth_enabled = true;
        let names: Vec<_> = installed_components(&opts)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert!(names.contains(&"stratus-auth".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("stratus-agent"));
    }

    /// Factory handing out the given mocks in order. The orchestrator builds
    /// the compensation provider first, then the one whose `create` runs.
    fn factory_from(mocks: Vec<MockInfrastructureProvider>) -> ProviderFactory {
        let queue = std::sync::Mutex::new(mocks.into_iter());
        Box::new(move |_, _| {
            let mut queue = queue.lock().unwrap();
            queue
                .next()
                .map(|m| Box::new(m) as Box<dyn InfrastructureProvider>)
                .ok_or_else(|| Error::provider("no provider left"))
        })
    }

    #[tokio::test]
    async fn failed_create_tears_down_and_clears_registry() {
        let dir = TempDir::new().unwrap();
        let registry = InstanceRegistry::open_in(dir.path()).unwrap();

        let mut for_ctx = MockInfrastructureProvider::new();
        for_ctx.expect_delete().times(1).returning(|| Ok(()));
        let mut for_create = MockInfrastructureProvider::new();
        for_create
            .expect_create()
            .times(1)
            .returning(|| Err(Error::provider("boom")));

        let orchestrator = Orchestrator::with_provider_factory(
            registry.clone(),
            factory_from(vec![for_ctx, for_create]),
        );
        let err = orchestrator.create(options("dev")).await.unwrap_err();

        assert!(
            matches!(&err, Error::Provisioning { step, .. } if step == "create_infrastructure"),
            "got: {}",
            err
        );
        assert!(!registry.exists("dev").unwrap());
    }

    #[tokio::test]
    async fn skip_teardown_preserves_record_and_skips_delete() {
        let dir = TempDir::new().unwrap();
        let registry = InstanceRegistry::open_in(dir.path()).unwrap();

        let mut for_ctx = MockInfrastructureProvider::new();
        for_ctx.expect_delete().times(0);
        let mut for_create = MockInfrastructureProvider::new();
        for_create
            .expect_create()
            .times(1)
            .returning(|| Err(Error::provider("boom")));

        let orchestrator = Orchestrator::with_provider_factory(
            registry.clone(),
            factory_from(vec![for_ctx, for_create]),
        );
        let mut opts = options("dev");
        opts.skip_teardown = true;
        let err = orchestrator.create(opts).await.unwrap_err();

        assert!(matches!(err, Error::Provisioning { .. }));
        // Everything stays in place for inspection
        assert!(registry.exists("dev").unwrap());
    }

    #[tokio::test]
    async fn failure_after_infrastructure_still_deletes_it() {
        let dir = TempDir::new().unwrap();
        let registry = InstanceRegistry::open_in(dir.path()).unwrap();

        let mut for_ctx = MockInfrastructureProvider::new();
        for_ctx.expect_delete().times(1).returning(|| Ok(()));
        let mut for_create = MockInfrastructureProvider::new();
        for_create
            .expect_create()
            .times(1)
            .returning(|| Ok(cert_handle("https://127.0.0.1:1")));

        let orchestrator = Orchestrator::with_provider_factory(
            registry.clone(),
            factory_from(vec![for_ctx, for_create]),
        );
        // The handle's credential is not a usable client certificate, so the
        // run dies at component installation, after infrastructure exists
        let err = orchestrator.create(options("dev")).await.unwrap_err();

        assert!(
            matches!(err, Error::Provisioning { .. } | Error::Teardown(_)),
            "got: {}",
            err
        );
        assert!(!registry.exists("dev").unwrap());
    }

    #[tokio::test]
    async fn skeleton_record_removed_when_provider_construction_fails() {
        let dir = TempDir::new().unwrap();
        let registry = InstanceRegistry::open_in(dir.path()).unwrap();

        let orchestrator = Orchestrator::with_provider_factory(
            registry.clone(),
            Box::new(|_, _| Err(Error::provider("no such substrate"))),
        );
        let err = orchestrator.create(options("dev")).await.unwrap_err();

        assert!(
            matches!(&err, Error::Provisioning { step, .. } if step == "create_infrastructure"),
            "got: {}",
            err
        );
        // The record written before the failure is compensated away
        assert!(!registry.exists("dev").unwrap());
    }

    #[tokio::test]
    async fn provider_error_survives_failed_inventory_drain() {
        let dir = TempDir::new().unwrap();
        let registry = InstanceRegistry::open_in(dir.path()).unwrap();
        // An unreadable inventory file makes the drain task fail too
        std::fs::write(registry.inventory_path("dev"), "{{not json").unwrap();

        let mut for_ctx = MockInfrastructureProvider::new();
        for_ctx.expect_delete().times(1).returning(|| Ok(()));
        let mut for_create = MockInfrastructureProvider::new();
        for_create
            .expect_create()
            .times(1)
            .returning(|| Err(Error::provider("provider exploded")));

        let orchestrator = Orchestrator::with_provider_factory(
            registry.clone(),
            factory_from(vec![for_ctx, for_create]),
        );
        let err = orchestrator.create(options("dev")).await.unwrap_err();

        // The drain failure is logged, not surfaced in place of the cause
        assert!(err.to_string().contains("provider exploded"), "got: {}", err);
    }
}
