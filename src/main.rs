use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mesh_operator::client::KubeClient;
use mesh_operator::controller::{self, ReconciliationHints};
use mesh_operator::crd::ServiceMeshControlPlane;
use mesh_operator::Error;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show managed control planes
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Directory holding the rendered charts, one subdirectory per
    /// supported version
    #[arg(
        long,
        env = "CHARTS_DIR",
        default_value = "/usr/local/share/istio-operator/helm"
    )]
    charts_dir: PathBuf,

    /// Concurrent reconcile workers per resource kind
    #[arg(long, env = "CONCURRENT_RECONCILERS", default_value_t = 1)]
    concurrent_reconcilers: u16,

    /// Use the CNI network-attachment strategy for member namespaces
    #[arg(long, env = "ENABLE_CNI")]
    cni: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Mesh namespace to inspect
    #[arg(long, env = "MESH_NAMESPACE", default_value = "istio-system")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Mesh Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: kube::Api<ServiceMeshControlPlane> = kube::Api::namespaced(client, &args.namespace);
    let control_planes = api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?;

    println!(
        "Managed control planes in {}: {}",
        args.namespace,
        control_planes.items.len()
    );
    for cp in control_planes {
        let name = cp.metadata.name.unwrap_or_default();
        let reconciled = cp
            .status
            .and_then(|status| status.reconciled_version)
            .unwrap_or_else(|| "-".to_string());
        println!("  {name}: spec {} / reconciled {reconciled}", cp.spec.version);
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    mesh_operator::telemetry::init_telemetry();

    info!("Starting Mesh Operator v{}", env!("CARGO_PKG_VERSION"));

    if !args.charts_dir.is_dir() {
        return Err(Error::ConfigError(format!(
            "charts directory {} does not exist",
            args.charts_dir.display()
        )));
    }

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let state = Arc::new(controller::ControllerState {
        client: client.clone(),
        cluster: Arc::new(KubeClient::new(client)),
        charts_dir: args.charts_dir,
        crd_lock: Arc::new(tokio::sync::Mutex::new(())),
        hints: Arc::new(ReconciliationHints::new()),
        concurrent_reconcilers: args.concurrent_reconcilers,
        cni_enabled: args.cni,
    });

    controller::run_controller(state).await
}
