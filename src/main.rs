use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewall::config::RatewallConfig;
use ratewall::ratelimit::{connect_store, ConfiguredStore};
use ratewall::web::{HttpServer, Interceptor, RateLimitLayer};

/// Fixed-window rate limiting in front of a demo HTTP service.
#[derive(Debug, Parser)]
#[command(name = "ratewall", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RATEWALL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Ratewall");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RatewallConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.http_addr = listen;
    }
    config.rate_limiting.validate()?;
    info!(
        http_addr = %config.server.http_addr,
        namespace = %config.rate_limiting.namespace,
        global_limit = config.rate_limiting.global.limit,
        routes = config.rate_limiting.routes.len(),
        failure_policy = ?config.rate_limiting.failure_policy,
        trust_proxy_headers = config.rate_limiting.trust_proxy_headers,
        "Configuration loaded"
    );

    // Initialize the counter store
    let store = connect_store(&config.rate_limiting.store).await?;
    let sweeper = match &store {
        ConfiguredStore::Memory(memory) => Some(
            memory
                .clone()
                .spawn_sweeper(config.rate_limiting.store.sweep_interval),
        ),
        ConfiguredStore::Shared(_) => None,
    };

    let interceptor = Interceptor::from_config(&config.rate_limiting, store.as_counter_store())?;
    info!("Rate limiter initialized");

    let app = Router::new()
        .route("/", get(|| async { "Hello from behind Ratewall" }))
        .route("/health", get(|| async { "ok" }))
        .route_layer(RateLimitLayer::from_shared(Arc::new(interceptor)));

    let server = HttpServer::new(config.server.http_addr, app);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Ratewall stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
