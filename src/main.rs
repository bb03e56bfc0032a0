//! Stratus - control-plane provisioning and teardown

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratus::config::{InstanceRegistry, ProviderConfig, ProviderKind};
use stratus::install::{CreateOptions, Orchestrator};
use stratus::uninstall::{DeleteOptions, Deleter};
use stratus::DEFAULT_NAMESPACE;

/// Stratus - provision and tear down control-plane instances
#[derive(Parser, Debug)]
#[command(name = "stratus", version, about, long_about = None)]
struct Cli {
    /// Directory holding the instance registry (defaults to ~/.stratus)
    #[arg(long, env = "STRATUS_CONFIG_DIR", global = true)]
    config_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a control-plane instance
    ///
    /// Provisions the Kubernetes runtime on the selected infrastructure
    /// provider, installs the control-plane components onto it, waits for
    /// the API to become reachable, and registers everything through the
    /// instance's own API. On failure everything created so far is torn
    /// down unless --skip-teardown is set.
    Create(CreateArgs),

    /// Delete a control-plane instance and its infrastructure
    Delete(DeleteArgs),

    /// List recorded instances
    List,
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Instance name
    name: String,

    /// Infrastructure provider: local, eks or aks
    #[arg(long, default_value = "local")]
    provider: ProviderKind,

    /// AWS region (eks)
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// AWS profile (eks)
    #[arg(long, env = "AWS_PROFILE", default_value = "default")]
    profile: String,

    /// Azure location (aks)
    #[arg(long)]
    location: Option<String>,

    /// Azure resource group (aks); defaults to stratus-<name>
    #[arg(long)]
    resource_group: Option<String>,

    /// Azure subscription id (aks)
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    subscription: Option<String>,

    /// Root domain for TLS alt-names and the public API endpoint
    #[arg(long)]
    root_domain: Option<String>,

    /// Number of worker nodes
    #[arg(long, default_value = "1")]
    worker_nodes: u32,

    /// Namespace the components are installed into
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Install authentication components
    #[arg(long)]
    auth: bool,

    /// Register this instance against an existing genesis control plane
    /// instead of making it self-hosting
    #[arg(long)]
    non_genesis: bool,

    /// Install onto a pre-existing runtime; skip infrastructure creation
    #[arg(long)]
    control_plane_only: bool,

    /// Create the runtime only; skip component installation
    #[arg(long)]
    infra_only: bool,

    /// Keep everything in place if provisioning fails
    #[arg(long)]
    skip_teardown: bool,

    /// Replace an existing registry record with the same name
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    /// Instance name
    name: String,

    /// Proceed past registry conflicts (instance not recorded)
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let registry = match &cli.config_dir {
        Some(dir) => InstanceRegistry::open_in(dir.clone())?,
        None => InstanceRegistry::open_default()?,
    };

    match cli.command {
        Commands::Create(args) => run_create(registry, args).await,
        Commands::Delete(args) => run_delete(registry, args).await,
        Commands::List => run_list(registry),
    }
}

async fn run_create(registry: InstanceRegistry, args: CreateArgs) -> anyhow::Result<()> {
    let provider_config = match args.provider {
        ProviderKind::Local => None,
        ProviderKind::Eks => Some(ProviderConfig::Eks {
            region: args
                .region
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--region is required for the eks provider"))?,
            profile: args.profile.clone(),
            account_id: None,
        }),
        ProviderKind::Aks => Some(ProviderConfig::Aks {
            location: args
                .location
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--location is required for the aks provider"))?,
            resource_group: args
                .resource_group
                .clone()
                .unwrap_or_else(|| format!("stratus-{}", args.name)),
            subscription: args.subscription.clone().ok_or_else(|| {
                anyhow::anyhow!("--subscription is required for the aks provider")
            })?,
            tenant: None,
        }),
    };

    let options = CreateOptions {
        name: args.name,
        provider: args.provider,
        provider_config,
        genesis: !args.non_genesis,
        auth_enabled: args.auth,
        root_domain: args.root_domain,
        worker_nodes: args.worker_nodes,
        control_plane_only: args.control_plane_only,
        infra_only: args.infra_only,
        skip_teardown: args.skip_teardown,
        force_overwrite: args.force,
        namespace: args.namespace,
    };

    // Compensation has already run by the time an error surfaces here; a
    // non-zero exit is all that remains
    Orchestrator::new(registry).create(options).await?;
    Ok(())
}

async fn run_delete(registry: InstanceRegistry, args: DeleteArgs) -> anyhow::Result<()> {
    Deleter::new(registry)
        .delete(&DeleteOptions {
            name: args.name,
            force: args.force,
        })
        .await?;
    Ok(())
}

fn run_list(registry: InstanceRegistry) -> anyhow::Result<()> {
    let current = registry.current()?;
    let instances = registry.list()?;
    if instances.is_empty() {
        println!("no instances recorded");
        return Ok(());
    }
    for instance in instances {
        let marker = if current.as_deref() == Some(instance.name.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<30} {:<8} {:<22} genesis={} {}",
            marker,
            instance.name,
            instance.provider,
            instance.state,
            instance.genesis,
            instance.api_server.unwrap_or_default(),
        );
    }
    Ok(())
}
