use crate::error::{PoolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use url::Url;

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "socks5" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Upstream proxy entity as persisted in the store
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UpstreamProxy {
    pub id: i64,
    pub ip: String,
    pub port: u16,
    pub protocol: String, // stored as text in the DB
    pub country: Option<String>,
    pub province: Option<String>,
    pub city: Option<String>,
    pub is_active: bool,
    pub priority: i64,
    pub last_checked: Option<DateTime<Utc>>,
}

impl UpstreamProxy {
    /// Get the protocol enum
    pub fn protocol_enum(&self) -> Option<ProxyProtocol> {
        ProxyProtocol::from_str(&self.protocol)
    }

    /// Render the upstream as a dialable URL
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.ip, self.port)
    }
}

/// IP location data attached to an upstream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub province: Option<String>,
    pub city: Option<String>,
}

impl GeoInfo {
    /// True when every field carries a non-empty value
    pub fn is_complete(&self) -> bool {
        [&self.country, &self.province, &self.city]
            .iter()
            .all(|f| f.as_deref().map(|s| !s.is_empty()).unwrap_or(false))
    }
}

/// Result of probing a single upstream against the target list
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub upstream: String,
    pub success: bool,
    pub first_successful_target: Option<String>,
    pub error: Option<String>,
}

/// Parsed identity of an upstream proxy URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    /// Parse a `protocol://ip:port` upstream URL.
    ///
    /// Rejects unknown schemes and URLs without an explicit port.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;

        let protocol = ProxyProtocol::from_str(url.scheme())
            .ok_or_else(|| PoolError::UnsupportedScheme(url.scheme().to_string()))?;

        let host = url
            .host_str()
            .ok_or_else(|| PoolError::UpstreamParse(format!("missing host in {}", raw)))?
            .to_string();

        let port = url
            .port()
            .ok_or_else(|| PoolError::UpstreamParse(format!("missing port in {}", raw)))?;

        Ok(ProxyEndpoint {
            protocol,
            host,
            port,
        })
    }

    /// The `host:port` form used for dialing
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}
