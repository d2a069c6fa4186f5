//! proxyring - entry point
//!
//! Wires the store, pool maintenance and the local proxy listener
//! together, with graceful shutdown support.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxyring::config::Config;
use proxyring::database::Database;
use proxyring::discovery;
use proxyring::error::Result;
use proxyring::geo::GeoLocator;
use proxyring::pool::{PoolManager, Prober};
use proxyring::proxy::{Forwarder, ProxyServer, Rotator};
use proxyring::repository::ProxyRepository;
use proxyring::scheduler::Scheduler;

/// Upstream dial timeout for forwarded connections
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on waiting for in-flight tasks at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxyring=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting proxyring");

    // Configuration file path may be given as the only argument.
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;
    info!(path = %config_path, "Configuration loaded");

    // Open the store; failure here is fatal.
    let db = Database::open(&config.database.path).await?;
    db.run_migrations().await?;

    // Offline geolocation is optional; enrichment is skipped without it.
    let geo = match Path::new(&config.geo.data_path).exists() {
        true => match GeoLocator::open(&config.geo.data_path) {
            Ok(locator) => Some(Arc::new(locator)),
            Err(e) => {
                warn!(path = %config.geo.data_path, error = %e, "Failed to load location database, enrichment disabled");
                None
            }
        },
        false => {
            warn!(path = %config.geo.data_path, "Location database not found, enrichment disabled");
            None
        }
    };

    let repo = ProxyRepository::new(
        db.pool().clone(),
        config.pool.priority_up_delta,
        config.pool.priority_down_delta,
    );

    let prober = Arc::new(Prober::new());
    let providers = discovery::providers_from_config(&config);
    info!(providers = providers.len(), "Discovery providers configured");

    let manager = Arc::new(PoolManager::new(
        repo.clone(),
        prober.clone(),
        providers,
        geo,
    ));

    let (rotator, topup_rx) = Rotator::new(
        config.pool.selection_mode,
        config.pool.only_china,
        config.pool.working_set_size,
    );
    info!(
        mode = config.pool.selection_mode.as_str(),
        only_china = config.pool.only_china,
        "Rotation configured"
    );

    // Evict leftovers from the previous run and load an initial working
    // set before accepting clients.
    if let Err(e) = repo.delete_low_priority().await {
        error!("Startup eviction failed: {}", e);
    }
    if let Err(e) = rotator.refresh(&repo).await {
        error!("Initial rotator refresh failed: {}", e);
    }

    let forwarder = Arc::new(Forwarder::new(rotator.clone(), repo.clone(), CONNECT_TIMEOUT));
    let server = ProxyServer::new(config.listen_addr(), forwarder);

    let scheduler = Scheduler::new(
        repo,
        prober,
        manager,
        rotator,
        Duration::from_secs(config.pool.tick_seconds),
        config.pool.min_pool_size,
    );

    let (shutdown_tx, _) = watch::channel(false);

    let server_shutdown = shutdown_tx.subscribe();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    let scheduler_shutdown = shutdown_tx.subscribe();
    let scheduler_task = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown, topup_rx).await;
    });

    shutdown_signal().await;
    info!("Shutdown signal received");

    // Close the listener first, then drain with a bound.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(DRAIN_TIMEOUT, async {
        let _ = tokio::join!(server_task, scheduler_task);
    })
    .await
    .is_err()
    {
        warn!("Drain timeout exceeded, exiting with tasks in flight");
    }

    db.close().await;
    info!("proxyring stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
