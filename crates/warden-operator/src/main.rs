use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_core::{
    ClusterApi, Controller, OperatorSettings, RedisTransport, RedisWire, ReplicationReconciler,
    SentinelReconciler,
};

mod kube_http;
mod metrics;

use kube_http::{KubeConfig, KubeHttp};
use metrics::{PrometheusObserver, Readiness};

#[derive(Parser)]
#[command(name = "warden-operator")]
#[command(version)]
#[command(about = "Keeps replicated Redis sets and their Sentinels converged")]
struct Cli {
    /// YAML settings file
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch; overrides the settings file
    #[arg(short, long, env = "WARDEN_NAMESPACE")]
    namespace: Option<String>,

    /// API server URL; defaults to the in-cluster service
    #[arg(long, env = "WARDEN_API_SERVER")]
    api_server: Option<String>,

    #[arg(long, env = "WARDEN_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    #[arg(long, env = "WARDEN_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Address serving /metrics, /healthz and /readyz
    #[arg(long, env = "WARDEN_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = load_settings(&cli)?;
    info!(
        namespace = %settings.namespace,
        tick_ms = settings.tick_interval_ms,
        "Starting redis warden operator"
    );

    metrics::init_metrics().context("failed to register metrics")?;

    let api: Arc<dyn ClusterApi> = Arc::new(
        KubeHttp::new(KubeConfig {
            api_server: cli.api_server.clone(),
            token_file: cli.token_file.clone(),
            ca_file: cli.ca_file.clone(),
            timeout: None,
        })
        .context("failed to configure the cluster API client")?,
    );
    let transport: Arc<dyn RedisTransport> = Arc::new(RedisWire);
    let observer = Arc::new(PrometheusObserver);

    let mut controllers = vec![
        Controller::new(
            Arc::new(ReplicationReconciler::new(
                api.clone(),
                transport.clone(),
                settings.clone(),
            )),
            settings.clone(),
        )
        .with_observer(observer.clone()),
        Controller::new(
            Arc::new(SentinelReconciler::new(api, transport, settings.clone())),
            settings.clone(),
        )
        .with_observer(observer),
    ];
    for controller in &mut controllers {
        controller.start();
        info!(kind = controller.kind(), "controller started");
    }

    let readiness = Readiness::default();
    readiness.mark_ready();

    let listener = tokio::net::TcpListener::bind(cli.metrics_addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.metrics_addr))?;
    info!(addr = %cli.metrics_addr, "serving metrics");

    let served = axum::serve(listener, metrics::create_router(readiness.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    readiness.mark_not_ready();
    for controller in &mut controllers {
        controller.shutdown().await;
    }
    info!("operator stopped");

    served.context("metrics server failed")
}

/// Settings file first, then command-line overrides.
fn load_settings(cli: &Cli) -> Result<OperatorSettings> {
    let mut settings = match &cli.config {
        Some(path) => OperatorSettings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => OperatorSettings::default(),
    };
    if let Some(namespace) = &cli.namespace {
        settings.namespace = namespace.clone();
    }
    settings.validate().context("invalid settings")?;
    if settings.namespace.is_empty() {
        warn!("no namespace configured, watching all namespaces");
    }
    Ok(settings)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warden_operator=info,warden_core=info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
