//! Periodic pool maintenance
//!
//! One ticker drives the maintenance cycle: evict exhausted upstreams,
//! probe and re-score the full active set, top up the pool when it runs
//! low, log country statistics, and refresh the rotator. Ticks run to
//! completion before the next one starts; an overrunning tick delays its
//! successor. Between ticks the scheduler also services top-up requests
//! coming from an empty rotator.

use crate::error::Result;
use crate::models::ProxyEndpoint;
use crate::pool::{PoolManager, Prober};
use crate::proxy::rotator::Rotator;
use crate::repository::ProxyRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

pub struct Scheduler {
    repo: ProxyRepository,
    prober: Arc<Prober>,
    manager: Arc<PoolManager>,
    rotator: Arc<Rotator>,
    tick: Duration,
    min_pool_size: i64,
}

impl Scheduler {
    pub fn new(
        repo: ProxyRepository,
        prober: Arc<Prober>,
        manager: Arc<PoolManager>,
        rotator: Arc<Rotator>,
        tick: Duration,
        min_pool_size: i64,
    ) -> Self {
        Self {
            repo,
            prober,
            manager,
            rotator,
            tick,
            min_pool_size,
        }
    }

    /// Run the maintenance loop until the shutdown signal fires
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, mut topup_rx: mpsc::Receiver<()>) {
        info!(interval_secs = self.tick.as_secs(), "Starting scheduler");

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
                Some(()) = topup_rx.recv() => {
                    info!("Working set exhausted, running discovery top-up");
                    self.manager.run().await;
                    if let Err(e) = self.rotator.refresh(&self.repo).await {
                        error!("Rotator refresh after top-up failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full maintenance pass. Every step is independent; failures
    /// are logged and never end the loop.
    pub async fn run_tick(&self) {
        match self.repo.delete_low_priority().await {
            Ok(0) => {}
            Ok(evicted) => info!(evicted, "Evicted exhausted upstreams"),
            Err(e) => error!("Eviction failed: {}", e),
        }

        if let Err(e) = self.score_active_upstreams().await {
            error!("Health pass failed: {}", e);
        }

        match self.repo.count().await {
            Ok(count) if count < self.min_pool_size => {
                info!(
                    count,
                    min = self.min_pool_size,
                    "Pool below minimum, running discovery"
                );
                self.manager.run().await;
            }
            Ok(count) => info!(count, "Pool size"),
            Err(e) => error!("Pool count failed: {}", e),
        }

        match self.repo.country_stats().await {
            Ok((china, other)) => info!(china, other, "Pool country statistics"),
            Err(e) => error!("Country statistics failed: {}", e),
        }

        if let Err(e) = self.rotator.refresh(&self.repo).await {
            error!("Rotator refresh failed: {}", e);
        }
    }

    /// Probe every active upstream concurrently and feed the outcomes
    /// back into the priority ledger
    async fn score_active_upstreams(&self) -> Result<()> {
        let proxies = self.repo.list_active_by_priority().await?;
        if proxies.is_empty() {
            info!("No stored upstreams to check");
            return Ok(());
        }

        info!(count = proxies.len(), "Probing active upstreams");

        let urls: Vec<String> = proxies.iter().map(|p| p.url()).collect();
        let outcomes = self.prober.check_batch(&urls).await;

        for outcome in outcomes {
            let endpoint = match ProxyEndpoint::parse(&outcome.upstream) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(upstream = %outcome.upstream, error = %e, "Skipping unparseable upstream");
                    continue;
                }
            };

            let result = if outcome.success {
                self.repo
                    .increase_priority(&endpoint.host, endpoint.port)
                    .await
            } else {
                self.repo
                    .decrease_priority(&endpoint.host, endpoint.port)
                    .await
            };

            if let Err(e) = result {
                warn!(upstream = %outcome.upstream, error = %e, "Failed to apply probe outcome");
            }
        }

        Ok(())
    }
}
