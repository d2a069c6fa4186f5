//! Candidate upstream discovery
//!
//! Providers query external search engines for hosts that expose a proxy
//! pool listing. Each discovered source serves a JSON array of raw
//! `ip:port` records under `/all`; those become candidate upstream URLs.
//! Discovery never probes, scores or persists anything.

mod fofa;
mod hunter;

pub use fofa::FofaProvider;
pub use hunter::HunterProvider;

use crate::config::Config;
use crate::error::{PoolError, Result};
use crate::models::GeoInfo;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// A host believed to serve a proxy listing, with whatever location data
/// the provider already knows about it
#[derive(Debug, Clone)]
pub struct CandidateSource {
    pub listing_url: String,
    pub geo: Option<GeoInfo>,
}

/// A pluggable discovery source
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Query the provider for candidate listing hosts. Remote failures
    /// are returned as `Discovery` errors; the caller logs and skips the
    /// provider for the round.
    async fn fetch_candidates(&self, client: &reqwest::Client) -> Result<Vec<CandidateSource>>;
}

/// Build the provider set for which credentials are configured
pub fn providers_from_config(config: &Config) -> Vec<Arc<dyn DiscoveryProvider>> {
    let mut providers: Vec<Arc<dyn DiscoveryProvider>> = Vec::new();

    if config.hunter.enabled() {
        providers.push(Arc::new(HunterProvider::new(config.hunter.api_key.clone())));
    }
    if config.fofa.enabled() {
        providers.push(Arc::new(FofaProvider::new(config.fofa.api_key.clone())));
    }

    providers
}

/// Shared HTTP client for discovery traffic
pub fn discovery_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("discovery HTTP client construction cannot fail")
}

/// One element of a proxy pool listing
#[derive(Debug, Deserialize)]
struct ListingEntry {
    proxy: String,
}

/// Fetch `{base}/all` and turn every `proxy` field into a candidate
/// upstream URL
pub async fn fetch_proxy_listing(client: &reqwest::Client, base_url: &str) -> Result<Vec<String>> {
    let url = format!("{}/all", base_url.trim_end_matches('/'));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| PoolError::Discovery(format!("GET {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(PoolError::Discovery(format!(
            "GET {}: status {}",
            url,
            response.status()
        )));
    }

    let entries: Vec<ListingEntry> = response
        .json()
        .await
        .map_err(|e| PoolError::Discovery(format!("decode {}: {}", url, e)))?;

    Ok(entries
        .into_iter()
        .map(|e| format!("http://{}", e.proxy))
        .collect())
}

/// Pick a page uniformly at random from `total` results at `page_size`
/// per page. Pages are 1-based.
pub(crate) fn random_page(total: i64, page_size: i64) -> i64 {
    let pages = (total + page_size - 1) / page_size;
    if pages <= 1 {
        return 1;
    }
    rand::Rng::gen_range(&mut rand::thread_rng(), 1..=pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_entry_decoding() {
        let body = r#"[
            {"proxy": "1.2.3.4:8080", "https": false, "region": "", "source": "x"},
            {"proxy": "5.6.7.8:3128", "check_count": 3}
        ]"#;
        let entries: Vec<ListingEntry> = serde_json::from_str(body).unwrap();
        let urls: Vec<String> = entries
            .into_iter()
            .map(|e| format!("http://{}", e.proxy))
            .collect();
        assert_eq!(urls, vec!["http://1.2.3.4:8080", "http://5.6.7.8:3128"]);
    }

    #[test]
    fn test_random_page_bounds() {
        assert_eq!(random_page(0, 10), 1);
        assert_eq!(random_page(5, 10), 1);
        assert_eq!(random_page(10, 10), 1);

        for _ in 0..50 {
            let page = random_page(95, 10);
            assert!((1..=10).contains(&page));
        }
    }

    #[test]
    fn test_providers_from_config_respect_credentials() {
        let config: Config = serde_yaml::from_str("hunter:\n  api_key: abc\n").unwrap();
        let providers = providers_from_config(&config);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "hunter");

        let config: Config =
            serde_yaml::from_str("hunter:\n  api_key: abc\nfofa:\n  api_key: def\n").unwrap();
        assert_eq!(providers_from_config(&config).len(), 2);

        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(providers_from_config(&config).is_empty());
    }
}
