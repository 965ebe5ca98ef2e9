use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::clock::{Clock, SystemClock};
use ratewarden::config::RatewardenConfig;
use ratewarden::ratelimit::{Dispatcher, Technique};
use ratewarden::retry::RetryPolicy;
use ratewarden::service::RateLimitedService;
use ratewarden::store;

#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "Run requests through a shared rate limiter")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Origin the requests are attributed to
    #[arg(short, long, default_value = "127.0.0.1")]
    origin: String,

    /// Number of concurrent requests to fire
    #[arg(short = 'n', long, default_value_t = 1)]
    requests: usize,

    /// Override the configured technique
    #[arg(short, long)]
    technique: Option<String>,

    /// Simulated duration of each protected operation in milliseconds
    #[arg(long, default_value_t = 50)]
    work_ms: u64,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RatewardenConfig::load(args.config.as_deref())?;
    if let Some(technique) = args.technique {
        config.technique = technique;
    }
    let technique: Technique = config.technique()?;
    info!(technique = %technique, backend = ?config.store.backend, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = store::open(&config.store, clock.clone()).await?;
    let dispatcher = Arc::new(Dispatcher::new(store, clock, &config.rate_limiting));
    let service = RateLimitedService::new(
        dispatcher,
        RetryPolicy::from_config(&config.retry),
        technique,
    );

    let work = Duration::from_millis(args.work_ms);
    info!(
        technique = %service.technique(),
        origin = %args.origin,
        requests = args.requests,
        "Firing requests"
    );
    let requests = (0..args.requests).map(|_| {
        service.handle_request(&args.origin, move || async move {
            tokio::time::sleep(work).await;
            Ok(())
        })
    });

    tokio::select! {
        statuses = futures::future::join_all(requests) => {
            for (i, status) in statuses.iter().enumerate() {
                println!("request {}: {}", i + 1, status);
            }
            let allowed = statuses.iter().filter(|s| **s == 200).count();
            info!(allowed, denied = statuses.len() - allowed, "All requests finished");
        }
        _ = shutdown_signal() => {
            warn!("Interrupted before all requests finished");
        }
    }

    info!("Ratewarden stopped");
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
