use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware, web::Data, App, HttpServer};
use clap::{Args, Parser, Subcommand};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kismatic::api::{self, ApiState};
use kismatic::controller::{MultiClusterController, State};
use kismatic::install::PlaybookExecutorFactory;
use kismatic::provision::{StoreSecretsGetter, TerraformFactory};
use kismatic::store::{ClusterStore, KvStore, CLUSTER_BUCKET};
use kismatic::util::telemetry;

const DEFAULT_TLS_PORT: u16 = 8443;
const DEFAULT_PLAIN_PORT: u16 = 8080;

#[derive(Parser)]
#[command(name = "kismatic", version, about = "Kubernetes cluster lifecycle daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server that manages cluster lifecycles.
    ///
    /// The API has endpoints to create, mutate, delete and view clusters. A
    /// local datastore persists the state of the clusters managed by this
    /// server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Port to start the server on (defaults to 8443 with TLS, 8080 without)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the TLS cert file
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// Path to the TLS key file
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Path of the file where the cluster database is kept
    #[arg(long, default_value = "kismatic.db")]
    db_file: PathBuf,

    /// Directory where per-cluster assets are generated
    #[arg(long, default_value = "clusters")]
    assets_dir: PathBuf,

    /// Seconds between full reconciliation passes over the store
    #[arg(long, default_value_t = 600)]
    reconcile_interval: u64,

    /// Serve plain HTTP instead of TLS
    #[arg(long, default_value_t = false)]
    insecure_disable_tls: bool,

    /// Logging filter directive for tracing_subscriber::filter::EnvFilter.
    /// Example: "info,kismatic=debug"
    #[arg(long, default_value = "info", env = "KISMATIC_LOG")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => server(args).await,
    }
}

async fn server(args: ServerArgs) -> anyhow::Result<()> {
    telemetry::init(&args.log_filter).await;

    let store = Arc::new(KvStore::open(&args.db_file)?);
    store.create_bucket(CLUSTER_BUCKET)?;
    let clusters = ClusterStore::new(store.clone(), CLUSTER_BUCKET);
    tokio::fs::create_dir_all(&args.assets_dir).await?;

    // Wire the supervisor with the terraform provisioner and the ansible
    // executor; credentials come from the secrets declared on each cluster.
    let state = State::default();
    let secrets = Arc::new(StoreSecretsGetter::new(clusters.clone()));
    let supervisor = MultiClusterController::new(
        args.assets_dir.clone(),
        clusters.clone(),
        Arc::new(PlaybookExecutorFactory::new()),
        Arc::new(TerraformFactory::new(secrets)),
        Duration::from_secs(args.reconcile_interval),
        state.clone(),
    );
    let shutdown = CancellationToken::new();
    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

    let api_state = ApiState {
        clusters,
        assets_root_dir: args.assets_dir.clone(),
        supervisor: state,
    };
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api_state.clone()))
            .wrap(middleware::Logger::default().exclude("/healthz"))
            .configure(api::configure)
    })
    .shutdown_timeout(5);

    let server = if args.insecure_disable_tls {
        let port = args.port.unwrap_or(DEFAULT_PLAIN_PORT);
        warn!("TLS is disabled, serving plain HTTP");
        info!(port, "starting server");
        server.bind(("0.0.0.0", port))?
    } else {
        let (cert_file, key_file) = match (&args.cert_file, &args.key_file) {
            (Some(cert), Some(key)) => (cert, key),
            _ => anyhow::bail!(
                "TLS requires --cert-file and --key-file; pass --insecure-disable-tls to serve plain HTTP"
            ),
        };
        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
        builder.set_private_key_file(key_file, SslFiletype::PEM)?;
        builder.set_certificate_chain_file(cert_file)?;
        let port = args.port.unwrap_or(DEFAULT_TLS_PORT);
        info!(port, "starting server with TLS");
        server.bind_openssl(("0.0.0.0", port), builder)?
    };

    // The server handles SIGINT/SIGTERM itself; once it drains, stop the
    // supervisor and wait for in-flight controller work to finish.
    server.run().await?;

    info!("shutting down the controllers");
    shutdown.cancel();
    if let Err(e) = supervisor_task.await {
        warn!(error = %e, "supervisor task failed during shutdown");
    }
    store.close();
    Ok(())
}
