//! helm-chart-operator — Kubernetes controller turning HelmChart resources
//! into helm-runner Jobs.
//!
//! The controller, a Lease-based leader election loop and a small health
//! probe server run as concurrent tasks within a single binary.

use std::sync::Arc;

use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tracing::{info, warn};
use warp::Filter;

use helm_chart_operator::controller::apply::ObjectSetApply;
use helm_chart_operator::controller::helm_chart::{self, Context};
use helm_chart_operator::helpers::{proxy_env, OperatorDefaults, DEFAULT_API_SERVER_PORT};
use helm_chart_operator::leader_election::{lease_name, LeaderElector};

#[derive(Parser, Debug)]
#[command(
    name = "helm-chart-operator",
    about = "Kubernetes controller for HelmChart resources"
)]
struct Args {
    /// Namespace the controller is scoped to; empty watches all namespaces.
    #[arg(long, default_value = "kube-system", env = "NAMESPACE")]
    namespace: String,

    /// Number of charts reconciled concurrently.
    #[arg(long, default_value_t = 2, env = "THREADS")]
    threads: u16,

    /// Identity written into the managed-by claim annotation; also prefixes
    /// the apply set ID and names the leader-election lease.
    #[arg(long, default_value = "helm-controller", env = "CONTROLLER_NAME")]
    controller_name: String,

    /// Node this replica runs on, used as the event-reporting instance.
    #[arg(long, default_value = "", env = "NODE_NAME")]
    node_name: String,

    /// ClusterRole bound to each chart's ServiceAccount.
    #[arg(long, default_value = "cluster-admin", env = "JOB_CLUSTER_ROLE")]
    job_cluster_role: String,

    /// Helm-runner image used when a chart does not name its own.
    #[arg(long, default_value = "", env = "DEFAULT_JOB_IMAGE")]
    default_job_image: String,

    /// API server port injected into bootstrap Jobs.
    #[arg(long, default_value = DEFAULT_API_SERVER_PORT, env = "API_SERVER_PORT")]
    api_server_port: String,

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

    info!(
        namespace = %args.namespace,
        controller = %args.controller_name,
        threads = args.threads,
        "starting helm-chart-operator"
    );

    let ctx = Arc::new(Context {
        client: client.clone(),
        defaults: OperatorDefaults {
            job_image: args.default_job_image,
            job_cluster_role: args.job_cluster_role,
            api_server_port: args.api_server_port,
            proxy_env: proxy_env(),
        },
        system_namespace: args.namespace.clone(),
        controller_name: args.controller_name.clone(),
        apply: ObjectSetApply::new(client.clone(), &args.controller_name),
        reporter: Reporter {
            controller: args.controller_name.clone(),
            instance: if args.node_name.is_empty() {
                std::env::var("POD_NAME").ok()
            } else {
                Some(args.node_name.clone())
            },
        },
    });

    // Parse health probe bind address (e.g. ":8081" or "0.0.0.0:8081").
    let health_addr: std::net::SocketAddr = args
        .health_probe_bind_address
        .strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or(args.health_probe_bind_address)
        .parse()
        .expect("invalid --health-probe-bind-address");

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    // Probes answer on every replica, leaders and hot standbys alike.
    tokio::spawn(warp::serve(health_routes).run(health_addr));

    // The lease lives in the system namespace; fall back to kube-system when
    // the controller watches all namespaces.
    let lease_namespace = if args.namespace.is_empty() {
        "kube-system".to_string()
    } else {
        args.namespace.clone()
    };
    let identity = if args.node_name.is_empty() {
        std::env::var("POD_NAME").unwrap_or_else(|_| args.controller_name.clone())
    } else {
        args.node_name.clone()
    };
    let elector = Arc::new(LeaderElector::new(
        client,
        &lease_name(&args.controller_name),
        &lease_namespace,
        &identity,
    ));

    // Non-leaders park here; only the leader starts draining queues.
    let mut guard = elector.acquire().await?;

    tokio::select! {
        _ = helm_chart::run(ctx, args.threads) => {},
        _ = guard.lost() => {
            // Another replica holds the lease now; exit and let the pod
            // restart into standby.
            warn!("leadership lost, shutting down");
        },
    }

    Ok(())
}
