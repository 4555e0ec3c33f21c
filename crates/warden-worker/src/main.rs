use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warden_client::{ClientSettings, FailoverClient, RedisConnector};
use warden_core::tls::TlsMaterial;

mod routes;

const PASSWORD_ENV: &str = "WARDEN_REDIS_PASSWORD";

#[derive(Parser)]
#[command(name = "warden-worker")]
#[command(version)]
#[command(about = "HTTP worker that reads and writes through the current Redis primary")]
struct Cli {
    /// Sentinel service host
    #[arg(
        long,
        env = "WARDEN_SENTINEL_HOST",
        default_value = "redissentinel-service.redis-database.svc.cluster.local"
    )]
    sentinel_host: String,

    #[arg(long, env = "WARDEN_SENTINEL_PORT", default_value_t = 26379)]
    sentinel_port: u16,

    /// Name Sentinel monitors the primary under
    #[arg(long, env = "WARDEN_MASTER_NAME", default_value = "mymaster")]
    master_name: String,

    /// Directory holding tls.crt, tls.key and ca.crt
    #[arg(long, env = "WARDEN_TLS_DIR")]
    tls_dir: Option<PathBuf>,

    #[arg(long, env = "WARDEN_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Deadline for each Redis command
    #[arg(long, default_value_t = 1000)]
    op_timeout_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting redis worker");

    let tls = match &cli.tls_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "loading TLS material");
            Some(TlsMaterial::from_dir(dir).context("failed to load TLS material")?)
        }
        None => None,
    };

    let op_timeout = Duration::from_millis(cli.op_timeout_ms);
    let connector = RedisConnector::new(&cli.sentinel_host, cli.sentinel_port)
        .with_password(std::env::var(PASSWORD_ENV).ok())
        .with_tls(tls)
        .with_timeout(op_timeout);

    let client = FailoverClient::connect(
        Arc::new(connector),
        &cli.master_name,
        ClientSettings {
            op_timeout,
            ..ClientSettings::default()
        },
    )
    .await
    .context("failed to connect to the primary through sentinel")?;
    info!("Successfully connected to redis");

    let app = routes::router(Arc::new(client));
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!(addr = %cli.listen, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden_worker=info,warden_client=info"));
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
