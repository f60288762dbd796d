//! reconcile-controller - Level-triggered reconciliation over a list+watch feed
//!
//! This is the main entry point: it mirrors a Kubernetes-style REST collection
//! and logs every object as it changes.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use reconcile_controller::cache::{namespace_index, Indexer, NAMESPACE_INDEX};
use reconcile_controller::config::Config;
use reconcile_controller::controller::{Context, Controller, LoggingHandler};
use reconcile_controller::error::AppError;
use reconcile_controller::models::DynamicObject;
use reconcile_controller::otel::{init_tracing, Metrics, OtelProvider};
use reconcile_controller::queue::{default_controller_rate_limiter, RateLimitingQueue};
use reconcile_controller::source::HttpSource;

/// reconcile-controller - Level-triggered reconciliation over a list+watch feed
#[derive(Parser, Debug)]
#[command(name = "reconcile-controller")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "RECONCILER_CONFIG")]
    config: Option<String>,

    /// Number of concurrent workers (overrides the configuration)
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Initialize OpenTelemetry provider
    let otel_provider = OtelProvider::new(&config.otel)?;

    // Initialize tracing/logging
    init_tracing(&otel_provider, &config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting reconcile-controller"
    );

    let metrics = Arc::new(Metrics::new(&otel_provider.meter()));
    let controller = build_controller(&config, metrics)?;

    // Cancel the controller on SIGINT/SIGTERM
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let result = controller.run(config.controller.workers, cancel).await;
    if let Err(e) = &result {
        error!(error = %e, "Controller failed");
    }

    // Shutdown OpenTelemetry
    if let Err(e) = otel_provider.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    info!("reconcile-controller shutdown complete");

    result.map_err(Into::into)
}

/// Load configuration from file or environment, then apply CLI overrides
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
        }
        None => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
        }
    };

    if let Some(workers) = args.workers {
        config.controller.workers = workers;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid --workers: {}", e))?;
    }

    Ok(config)
}

/// Wire the HTTP source, indexed cache, queue and logging handler together
fn build_controller(
    config: &Config,
    metrics: Arc<Metrics>,
) -> Result<Controller<DynamicObject>, AppError> {
    let cache = Arc::new(Indexer::<DynamicObject>::new());
    cache.add_index(NAMESPACE_INDEX, namespace_index::<DynamicObject>)?;

    let queue = RateLimitingQueue::new(
        "controller",
        Arc::new(default_controller_rate_limiter(&config.rate_limit)),
    );
    let handler = Arc::new(LoggingHandler::new(Arc::clone(&cache)));
    let ctx = Context::new(cache, queue, handler).with_metrics(metrics);

    let source = HttpSource::<DynamicObject>::new(&config.source)?;
    info!(
        url = %source.collection_url(),
        authenticated = config.source.token_file.is_some(),
        "Watching remote collection"
    );

    Ok(Controller::new(
        Arc::new(source),
        ctx,
        &config.controller,
        config.relist.clone(),
    ))
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
