//! redis-sentinel-operator binary
//!
//! Runs the RedisSentinel controller and the HTTP endpoints until a
//! shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use redis_sentinel_operator::controller::{
    run_controller, ControllerSettings, ControllerState, QuorumPolicy,
};
use redis_sentinel_operator::crd::RedisSentinel;
use redis_sentinel_operator::rest_api;

/// Operator configuration, from flags or the environment
#[derive(Parser, Debug)]
#[command(name = "redis-sentinel-operator", version, about)]
struct OperatorConfig {
    /// Only watch this namespace (default: all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Address for /health and /metrics
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    #[arg(long, env = "SENTINEL_PORT", default_value_t = 26379)]
    sentinel_port: u16,

    /// Sentinel connect timeout in milliseconds
    #[arg(long, env = "SENTINEL_CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    sentinel_connect_timeout_ms: u64,

    /// Sentinel read timeout in milliseconds
    #[arg(long, env = "SENTINEL_READ_TIMEOUT_MS", default_value_t = 2000)]
    sentinel_read_timeout_ms: u64,

    /// First retry delay after a failed pass, in seconds
    #[arg(long, env = "BACKOFF_BASE_SECS", default_value_t = 5)]
    backoff_base_secs: u64,

    /// Retry delay cap, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,

    /// Sentinels that must answer before their majority is trusted
    /// (default: a strict majority of the sentinel tier)
    #[arg(long, env = "QUORUM_MIN_REACHABLE")]
    min_reachable: Option<usize>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,

    /// Print the CRD manifest as YAML and exit
    #[arg(long)]
    print_crd: bool,

    /// Install or update the CRD in the cluster and exit
    #[arg(long)]
    install_crd: bool,
}

impl OperatorConfig {
    fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            namespace: self.namespace.clone(),
            sentinel_port: self.sentinel_port,
            sentinel_connect_timeout: Duration::from_millis(self.sentinel_connect_timeout_ms),
            sentinel_read_timeout: Duration::from_millis(self.sentinel_read_timeout_ms),
            backoff_base_secs: self.backoff_base_secs,
            backoff_max_secs: self.backoff_max_secs,
            quorum: QuorumPolicy {
                min_reachable: self.min_reachable,
            },
            ..Default::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn install_crd(client: Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let crd = RedisSentinel::crd();
    let name = crd.metadata.name.clone().context("CRD has no name")?;
    crds.patch(
        &name,
        &PatchParams::apply("redis-sentinel-operator").force(),
        &Patch::Apply(&crd),
    )
    .await
    .with_context(|| format!("failed to apply CRD {}", name))?;
    info!("CRD {} installed", name);
    Ok(())
}

/// Resolve once SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    if config.print_crd {
        print!("{}", serde_yaml::to_string(&RedisSentinel::crd())?);
        return Ok(());
    }

    init_tracing(config.json_logs);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("*"),
        "Starting redis-sentinel-operator"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    if config.install_crd {
        return install_crd(client).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(ControllerState::new(
        client,
        config.controller_settings(),
        shutdown_rx,
    ));

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, finishing in-flight actions");
        let _ = shutdown_tx.send(true);
    });

    let server_state = state.clone();
    let http_addr = config.http_addr;
    let server = tokio::spawn(async move {
        if let Err(e) = rest_api::run_server(http_addr, server_state).await {
            error!("HTTP server failed: {}", e);
        }
    });

    let result = run_controller(state).await;
    server.abort();
    result.context("controller terminated with an error")?;

    info!("Controller stopped");
    Ok(())
}
