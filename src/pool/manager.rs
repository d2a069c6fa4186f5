//! Pool maintenance: discovery -> probing -> store writes
//!
//! Providers run in parallel, candidate sources within a provider run in
//! parallel, and verified candidates are stored in parallel. A failure in
//! any branch is logged and never aborts sibling branches.

use crate::discovery::{self, CandidateSource, DiscoveryProvider};
use crate::error::{PoolError, Result};
use crate::geo::GeoLocator;
use crate::models::{GeoInfo, ProxyEndpoint};
use crate::pool::Prober;
use crate::repository::ProxyRepository;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PoolManager {
    repo: ProxyRepository,
    prober: Arc<Prober>,
    providers: Vec<Arc<dyn DiscoveryProvider>>,
    geo: Option<Arc<GeoLocator>>,
    client: reqwest::Client,
}

impl PoolManager {
    pub fn new(
        repo: ProxyRepository,
        prober: Arc<Prober>,
        providers: Vec<Arc<dyn DiscoveryProvider>>,
        geo: Option<Arc<GeoLocator>>,
    ) -> Self {
        Self {
            repo,
            prober,
            providers,
            geo,
            client: discovery::discovery_client(),
        }
    }

    /// Run one full discovery round across every configured provider
    pub async fn run(&self) {
        if self.providers.is_empty() {
            debug!("No discovery providers configured, skipping pool run");
            return;
        }

        info!(providers = self.providers.len(), "Starting discovery run");

        join_all(
            self.providers
                .iter()
                .map(|provider| self.run_provider(provider.clone())),
        )
        .await;

        info!("Discovery run complete");
    }

    async fn run_provider(&self, provider: Arc<dyn DiscoveryProvider>) {
        let sources = match provider.fetch_candidates(&self.client).await {
            Ok(sources) => sources,
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "Discovery provider failed, skipping this round");
                return;
            }
        };

        info!(
            provider = provider.name(),
            sources = sources.len(),
            "Discovered candidate sources"
        );

        join_all(sources.into_iter().map(|source| self.process_source(source))).await;
    }

    /// Fetch one candidate source's listing, probe it, store the survivors
    async fn process_source(&self, source: CandidateSource) {
        let candidates = match discovery::fetch_proxy_listing(&self.client, &source.listing_url).await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(source = %source.listing_url, error = %e, "Failed to fetch proxy listing");
                return;
            }
        };

        if candidates.is_empty() {
            return;
        }

        let outcomes = self.prober.check_batch(&candidates).await;

        join_all(outcomes.iter().filter(|o| o.success).map(|outcome| {
            let geo = source.geo.clone();
            async move {
                if let Err(e) = self.store_candidate(&outcome.upstream, geo).await {
                    warn!(upstream = %outcome.upstream, error = %e, "Failed to store upstream");
                }
            }
        }))
        .await;
    }

    /// Persist a verified candidate, enriching location data when the
    /// discovery source did not provide it
    async fn store_candidate(&self, upstream: &str, geo: Option<GeoInfo>) -> Result<()> {
        let endpoint = ProxyEndpoint::parse(upstream)?;

        let geo = match geo {
            Some(geo) if geo.is_complete() => geo,
            partial => self
                .geo
                .as_ref()
                .and_then(|locator| locator.lookup(&endpoint.host))
                .or(partial)
                .unwrap_or_default(),
        };

        if self.repo.exists(&endpoint.host, endpoint.port).await? {
            self.repo
                .update_geo(&endpoint.host, endpoint.port, &geo)
                .await?;
            debug!(upstream, "Updated known upstream");
            return Ok(());
        }

        // Discovery only ever yields plain HTTP proxies. A racing
        // rediscovery can lose the exists/insert window; the unique
        // (ip, port) constraint turns that into AlreadyExists, which is
        // the update case.
        match self
            .repo
            .insert(&endpoint.host, endpoint.port, "http", &geo)
            .await
        {
            Ok(()) => {
                info!(upstream, "Stored verified upstream");
                Ok(())
            }
            Err(PoolError::AlreadyExists(_)) => {
                self.repo
                    .update_geo(&endpoint.host, endpoint.port, &geo)
                    .await
            }
            Err(e) => Err(e),
        }
    }
}
