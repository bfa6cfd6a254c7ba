//! iperf3 exporter
//!
//! Probes iperf3 servers on a schedule, caches the latest result per target
//! and serves them, plus on-demand probes, as Prometheus metrics.

mod cache;
mod config;
mod probe;
mod scheduler;
mod web;

use cache::ResultCache;
use config::{ExporterConfig, LogFormat, LoggingConfig};
use probe::{Iperf3Runner, MeasurementRunner};
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let cfg = ExporterConfig::load()?;

    init_logging(&cfg.logging)?;
    tracing::info!("Starting iperf3 exporter {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Using iperf3 binary {}", cfg.iperf3_path.display());

    let cfg = Arc::new(cfg);
    let cache = Arc::new(ResultCache::new());
    let runner: Arc<dyn MeasurementRunner> = Arc::new(Iperf3Runner::new(&cfg.iperf3_path));

    // Start scheduler
    let scheduler = Scheduler::new(cache.clone(), runner.clone());
    scheduler.start(cfg.targets.clone()).await;
    tracing::info!("Scheduling {} of {} configured targets", scheduler.len().await, cfg.targets.len());

    // Start web server
    let server = Server::new(cfg, cache, runner);
    let served = server.start(shutdown_signal()).await;

    scheduler.shutdown().await;
    tracing::info!("Shutdown complete");

    served
}

fn init_logging(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(format!(
            "iperf3_exporter={level},tower_http={level}",
            level = logging.level
        )),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Logfmt => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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

    tracing::info!("Shutdown signal received");
}
