use super::{random_page, CandidateSource, DiscoveryProvider};
use crate::error::{PoolError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde::Deserialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://fofa.info/api/v1/search";
const PAGE_SIZE: i64 = 40;

const SEARCH_STATEMENT: &str = r#"body="get all proxy from proxy pool"&&status_code="200""#;

/// Discovery via the FOFA search API
pub struct FofaProvider {
    api_key: String,
    base_url: String,
}

/// FOFA returns rows as positional arrays: [full_address, ip, port]
#[derive(Debug, Deserialize)]
struct FofaResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    results: Vec<Vec<String>>,
}

impl FofaProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self { api_key, base_url }
    }

    fn query_url(&self, page: i64, size: i64) -> String {
        let encoded = URL_SAFE.encode(SEARCH_STATEMENT);
        format!(
            "{}/all?&key={}&qbase64={}&page={}&size={}",
            self.base_url, self.api_key, encoded, page, size
        )
    }

    async fn fetch_page(&self, client: &reqwest::Client, url: &str) -> Result<FofaResponse> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| PoolError::Discovery(format!("fofa request: {}", e)))?;

        if !response.status().is_success() {
            return Err(PoolError::Discovery(format!(
                "fofa request: status {}",
                response.status()
            )));
        }

        let decoded = response
            .json::<FofaResponse>()
            .await
            .map_err(|e| PoolError::Discovery(format!("fofa decode: {}", e)))?;

        if decoded.error {
            return Err(PoolError::Discovery(format!(
                "fofa returned error: {}",
                decoded.errmsg
            )));
        }

        Ok(decoded)
    }
}

#[async_trait]
impl DiscoveryProvider for FofaProvider {
    fn name(&self) -> &'static str {
        "fofa"
    }

    async fn fetch_candidates(&self, client: &reqwest::Client) -> Result<Vec<CandidateSource>> {
        let probe = self.fetch_page(client, &self.query_url(1, 1)).await?;
        if probe.size <= 0 {
            debug!("fofa returned no results");
            return Ok(Vec::new());
        }

        let page = random_page(probe.size, PAGE_SIZE);
        let response = self
            .fetch_page(client, &self.query_url(page, PAGE_SIZE))
            .await?;

        let candidates = response
            .results
            .iter()
            .filter(|row| !row.is_empty() && !row[0].is_empty())
            .map(|row| CandidateSource {
                listing_url: normalize_address(&row[0]),
                geo: None,
            })
            .collect();

        Ok(candidates)
    }
}

/// FOFA addresses may arrive without a scheme
fn normalize_address(address: &str) -> String {
    if address.contains("http") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_url_encodes_statement() {
        let provider = FofaProvider::with_base_url("key".into(), "http://127.0.0.1:1".into());
        let url = provider.query_url(2, 40);

        assert!(url.starts_with("http://127.0.0.1:1/all?&key=key&qbase64="));
        assert!(url.ends_with("&page=2&size=40"));

        let encoded = url
            .split("qbase64=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        let decoded = URL_SAFE.decode(encoded).unwrap();
        assert_eq!(decoded, SEARCH_STATEMENT.as_bytes());
    }

    #[test]
    fn test_response_decoding() {
        let body = r#"{
            "error": false,
            "size": 120,
            "page": 1,
            "mode": "extended",
            "results": [
                ["https://1.2.3.4:8443", "1.2.3.4", "8443"],
                ["5.6.7.8:3128", "5.6.7.8", "3128"]
            ]
        }"#;
        let response: FofaResponse = serde_json::from_str(body).unwrap();
        assert!(!response.error);
        assert_eq!(response.size, 120);
        assert_eq!(response.results.len(), 2);

        assert_eq!(normalize_address(&response.results[0][0]), "https://1.2.3.4:8443");
        assert_eq!(normalize_address(&response.results[1][0]), "http://5.6.7.8:3128");
    }

    #[test]
    fn test_error_payload_is_discovery_error() {
        let body = r#"{"error": true, "errmsg": "account invalid", "size": 0, "results": []}"#;
        let response: FofaResponse = serde_json::from_str(body).unwrap();
        assert!(response.error);
        assert_eq!(response.errmsg, "account invalid");
    }
}
