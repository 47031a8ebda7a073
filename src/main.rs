//! release-agent: reconciles Helm releases in one namespace from a control
//! plane's desired state.
//!
//! The reconcile loop, the node metrics reporter and the health probes run as
//! concurrent tokio tasks within a single binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use kube::Client;
use tracing::info;
use warp::Filter;

use release_agent::cluster::KubeCluster;
use release_agent::control_plane::HttpControlPlane;
use release_agent::controller::actions::ActionFactory;
use release_agent::controller::reconciler::{self, Context};
use release_agent::controller::status::KindRegistry;
use release_agent::helm::HelmCli;
use release_agent::metrics::MetricsReporter;
use release_agent::revision_store::{FileRevisionStore, RevisionStore, SecretRevisionStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StoreBackend {
    Secret,
    File,
}

#[derive(Parser, Debug)]
#[command(
    name = "release-agent",
    about = "In-cluster agent that reconciles Helm releases from a control plane"
)]
struct Args {
    /// Base URL of the control plane API.
    #[arg(long, env = "CONTROL_PLANE_URL")]
    control_plane_url: String,

    /// Bearer token identifying this deployment target.
    #[arg(long, env = "TARGET_TOKEN", hide_env_values = true)]
    target_token: String,

    /// Namespace this agent reconciles.
    #[arg(long, default_value = "default", env = "TARGET_NAMESPACE")]
    namespace: String,

    /// Seconds between reconcile passes.
    #[arg(long, default_value_t = 5, env = "RECONCILE_INTERVAL_SECS")]
    interval_secs: u64,

    /// Seconds between node metrics reports (at least 30).
    #[arg(long, default_value_t = 60, env = "METRICS_INTERVAL_SECS")]
    metrics_interval_secs: u64,

    /// Path to the helm binary.
    #[arg(long, default_value = "helm", env = "HELM_BINARY")]
    helm_binary: PathBuf,

    /// Scratch directory for charts, values files and registry configs.
    #[arg(long, default_value = "/tmp/release-agent", env = "AGENT_WORK_DIR")]
    work_dir: PathBuf,

    /// Talk to OCI registries over plain HTTP.
    #[arg(long, env = "REGISTRY_PLAIN_HTTP")]
    plain_http: bool,

    /// Where revision records are kept.
    #[arg(long, value_enum, default_value = "secret", env = "REVISION_STORE")]
    revision_store: StoreBackend,

    /// Directory for the file revision store.
    #[arg(
        long,
        default_value = "/var/lib/release-agent",
        env = "REVISION_STORE_DIR"
    )]
    revision_store_dir: PathBuf,

    /// Maximum concurrent object writes during apply and restart.
    #[arg(long, default_value_t = 4, env = "APPLY_CONCURRENCY")]
    apply_concurrency: usize,

    /// Bind address for health probe endpoints (/healthz, /readyz).
    #[arg(long, default_value = ":8081", env = "HEALTH_PROBE_BIND_ADDRESS")]
    health_probe_bind_address: String,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let client = Client::try_default().await?;
    let control_plane = Arc::new(HttpControlPlane::new(
        args.control_plane_url.clone(),
        args.target_token,
    )?);

    let store: Arc<dyn RevisionStore> = match args.revision_store {
        StoreBackend::Secret => Arc::new(SecretRevisionStore::new(client.clone())),
        StoreBackend::File => Arc::new(FileRevisionStore::new(args.revision_store_dir)),
    };

    info!(
        ns = %args.namespace,
        control_plane = %args.control_plane_url,
        store = ?args.revision_store,
        "starting release-agent"
    );

    let ctx = Arc::new(Context {
        cluster: Arc::new(KubeCluster::new(client.clone())),
        helm: Arc::new(HelmCli::new(args.helm_binary)?),
        store,
        control_plane: control_plane.clone(),
        actions: ActionFactory::new(args.work_dir, args.plain_http, control_plane.clone()),
        kinds: KindRegistry::default(),
        apply_concurrency: args.apply_concurrency.max(1),
    });

    let metrics = MetricsReporter::new(
        client,
        control_plane,
        Duration::from_secs(args.metrics_interval_secs),
    );

    // Accept ":8081" as well as "0.0.0.0:8081".
    let health_addr: std::net::SocketAddr = args
        .health_probe_bind_address
        .strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or_else(|| args.health_probe_bind_address.clone())
        .parse()
        .with_context(|| {
            format!(
                "invalid --health-probe-bind-address {:?}",
                args.health_probe_bind_address
            )
        })?;

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    tokio::select! {
        _ = reconciler::run(ctx, args.namespace, Duration::from_secs(args.interval_secs.max(1))) => {},
        _ = metrics.run() => {},
        _ = warp::serve(health_routes).run(health_addr) => {},
    }

    Ok(())
}
