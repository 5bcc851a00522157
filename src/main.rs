use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, StoreBackend};
use gatekeeper::http::HttpServer;
use gatekeeper::ratelimit::{SlidingWindowLimiter, Sweeper};
use gatekeeper::store::{CountingStore, MemoryStore, RedisStore};

/// Distributed sliding-window rate limiting service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Gatekeeper Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => GatekeeperConfig::from_file(path)?,
        None => GatekeeperConfig::default(),
    };
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        store = ?config.store.backend,
        strategy = ?config.limiter.strategy,
        "Configuration loaded"
    );

    let store: Arc<dyn CountingStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-process store; counters are not shared between instances");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.store.redis_url, config.store.response_timeout()).await?,
        ),
    };

    let rules = Arc::new(config.rule_registry()?);
    info!(rules = rules.len(), "Rules registered");

    let limiter = Arc::new(
        SlidingWindowLimiter::new(store, rules)
            .with_key_prefix(config.limiter.key_prefix.clone())
            .with_strategy(config.limiter.execution_strategy()),
    );
    info!("Rate limiter initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = config.sweeper.interval().map(|interval| {
        let sweeper = Sweeper::new(limiter.clone(), interval);
        let mut rx = shutdown_rx;
        tokio::spawn(sweeper.run(async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }))
    });

    let server = HttpServer::new(config.server.http_addr, limiter);

    // Run the server with graceful shutdown on Ctrl+C, then stop the sweeper
    let result = server.serve_with_shutdown(shutdown_signal()).await;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper {
        handle.await?;
    }
    result?;

    info!("Gatekeeper Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
