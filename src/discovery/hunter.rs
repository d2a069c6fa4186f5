use super::{random_page, CandidateSource, DiscoveryProvider};
use crate::error::{PoolError, Result};
use crate::models::GeoInfo;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde::Deserialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://hunter.qianxin.com/openApi";
const PAGE_SIZE: i64 = 10;

/// Search statements that match hosts serving a proxy pool listing
const SEARCH_STATEMENTS: [&str; 2] = [
    r#"web.body="get all proxy from proxy pool"&&ip.country=="中国""#,
    r#"web.body="get all proxy from proxy pool"&&ip.country=="美国""#,
];

/// Discovery via the Hunter search API
pub struct HunterProvider {
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct HunterResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    data: HunterData,
}

#[derive(Debug, Default, Deserialize)]
struct HunterData {
    #[serde(default)]
    total: i64,
    #[serde(default)]
    arr: Vec<HunterEntry>,
}

#[derive(Debug, Deserialize)]
struct HunterEntry {
    #[serde(default)]
    url: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    province: String,
    #[serde(default)]
    city: String,
}

impl HunterProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self { api_key, base_url }
    }

    fn query_url(&self, search: &str, page: i64, page_size: i64) -> String {
        let encoded = URL_SAFE.encode(search);
        format!(
            "{}/search?api-key={}&search={}&page={}&page_size={}",
            self.base_url, self.api_key, encoded, page, page_size
        )
    }

    async fn fetch_page(&self, client: &reqwest::Client, url: &str) -> Result<HunterResponse> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| PoolError::Discovery(format!("hunter request: {}", e)))?;

        if !response.status().is_success() {
            return Err(PoolError::Discovery(format!(
                "hunter request: status {}",
                response.status()
            )));
        }

        response
            .json::<HunterResponse>()
            .await
            .map_err(|e| PoolError::Discovery(format!("hunter decode: {}", e)))
    }
}

#[async_trait]
impl DiscoveryProvider for HunterProvider {
    fn name(&self) -> &'static str {
        "hunter"
    }

    async fn fetch_candidates(&self, client: &reqwest::Client) -> Result<Vec<CandidateSource>> {
        // Small query first, just to learn the result count.
        let probe = self
            .fetch_page(client, &self.query_url(SEARCH_STATEMENTS[0], 1, 1))
            .await?;
        if probe.code != 0 && probe.code != 200 {
            return Err(PoolError::Discovery(format!(
                "hunter returned code {}",
                probe.code
            )));
        }
        if probe.data.total <= 0 {
            debug!("hunter returned no results");
            return Ok(Vec::new());
        }

        let page = random_page(probe.data.total, PAGE_SIZE);

        let mut candidates = Vec::new();
        for statement in SEARCH_STATEMENTS {
            let response = self
                .fetch_page(client, &self.query_url(statement, page, PAGE_SIZE))
                .await?;

            for entry in response.data.arr {
                if entry.url.is_empty() {
                    continue;
                }
                let geo = entry_geo(&entry);
                candidates.push(CandidateSource {
                    listing_url: entry.url,
                    geo,
                });
            }
        }

        Ok(candidates)
    }
}

fn entry_geo(entry: &HunterEntry) -> Option<GeoInfo> {
    if entry.country.is_empty() && entry.province.is_empty() && entry.city.is_empty() {
        return None;
    }
    let field = |s: &str| (!s.is_empty()).then(|| s.to_string());
    Some(GeoInfo {
        country: field(&entry.country),
        province: field(&entry.province),
        city: field(&entry.city),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_url_encodes_search() {
        let provider =
            HunterProvider::with_base_url("key123".into(), "http://127.0.0.1:1/api".into());
        let url = provider.query_url(SEARCH_STATEMENTS[0], 3, 10);

        assert!(url.starts_with("http://127.0.0.1:1/api/search?api-key=key123&search="));
        assert!(url.ends_with("&page=3&page_size=10"));
        // The raw statement must not leak unencoded.
        assert!(!url.contains("web.body"));

        let encoded = url
            .split("search=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        let decoded = URL_SAFE.decode(encoded).unwrap();
        assert_eq!(decoded, SEARCH_STATEMENTS[0].as_bytes());
    }

    #[test]
    fn test_response_decoding() {
        let body = r#"{
            "code": 200,
            "data": {
                "total": 42,
                "arr": [
                    {"url": "http://1.2.3.4:8080", "ip": "1.2.3.4", "port": 8080,
                     "country": "中国", "province": "广东", "city": "深圳"},
                    {"url": "http://5.6.7.8:80", "ip": "5.6.7.8", "port": 80,
                     "country": "", "province": "", "city": ""}
                ]
            }
        }"#;
        let response: HunterResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.data.total, 42);
        assert_eq!(response.data.arr.len(), 2);

        let geo = entry_geo(&response.data.arr[0]).unwrap();
        assert_eq!(geo.country.as_deref(), Some("中国"));
        assert!(geo.is_complete());

        assert!(entry_geo(&response.data.arr[1]).is_none());
    }

    #[test]
    fn test_response_decoding_tolerates_missing_fields() {
        let response: HunterResponse = serde_json::from_str(r#"{"code": 0}"#).unwrap();
        assert_eq!(response.data.total, 0);
        assert!(response.data.arr.is_empty());
    }
}
