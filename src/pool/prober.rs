//! Concurrent upstream reachability probing
//!
//! Every upstream in a batch is checked in parallel against an ordered
//! list of probe targets; the first 2xx answer proves the upstream can
//! reach the open internet and short-circuits the rest of the list.
//! Probing has no store side effects, it only reports outcomes.

use crate::error::{PoolError, Result};
use crate::models::{ProbeOutcome, ProxyEndpoint};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hard per-request timeout for probe traffic
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reference URLs used to test whether an upstream reaches the internet
pub const DEFAULT_PROBE_TARGETS: [&str; 5] = [
    "https://www.google.com",
    "https://www.baidu.com",
    "http://www.baidu.com",
    "https://www.yulate.com",
    "https://www.ip138.com",
];

/// One probe attempt through one upstream. Swappable so tests can script
/// per-target outcomes.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// `Ok(())` when `target` answered 2xx through `upstream`
    async fn probe(&self, upstream: &str, target: &str) -> Result<()>;
}

/// Probe transport that issues real GETs through the upstream proxy
pub struct HttpProbeTransport {
    timeout: Duration,
}

impl HttpProbeTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpProbeTransport {
    fn default() -> Self {
        Self::new(PROBE_TIMEOUT)
    }
}

#[async_trait]
impl ProbeTransport for HttpProbeTransport {
    async fn probe(&self, upstream: &str, target: &str) -> Result<()> {
        let proxy = reqwest::Proxy::all(upstream)
            .map_err(|e| PoolError::UpstreamParse(format!("{}: {}", upstream, e)))?;

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()?;

        let response = client
            .get(target)
            .send()
            .await
            .map_err(|e| PoolError::Dial(format!("{} via {}: {}", target, upstream, e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(PoolError::Handshake(format!(
                "{} via {}: status {}",
                target,
                upstream,
                response.status()
            )))
        }
    }
}

/// Batch prober over an ordered probe-target list
pub struct Prober {
    transport: Arc<dyn ProbeTransport>,
    targets: Vec<String>,
}

impl Prober {
    pub fn new() -> Self {
        Self::with_transport(
            Arc::new(HttpProbeTransport::default()),
            DEFAULT_PROBE_TARGETS.iter().map(|t| t.to_string()).collect(),
        )
    }

    pub fn with_transport(transport: Arc<dyn ProbeTransport>, targets: Vec<String>) -> Self {
        Self { transport, targets }
    }

    /// Probe every upstream in the batch concurrently. Returns when the
    /// last upstream has finished; concurrency is bounded only by the
    /// batch size (batches are tens of upstreams, not thousands).
    pub async fn check_batch(&self, upstreams: &[String]) -> Vec<ProbeOutcome> {
        join_all(upstreams.iter().map(|upstream| self.check_one(upstream))).await
    }

    /// Probe one upstream against the target list in order
    pub async fn check_one(&self, upstream: &str) -> ProbeOutcome {
        // Reject unknown schemes up front; this is a failed outcome, not
        // a success.
        if let Err(e) = ProxyEndpoint::parse(upstream) {
            return ProbeOutcome {
                upstream: upstream.to_string(),
                success: false,
                first_successful_target: None,
                error: Some(e.to_string()),
            };
        }

        for target in &self.targets {
            match self.transport.probe(upstream, target).await {
                Ok(()) => {
                    debug!(upstream, target, "Probe succeeded");
                    return ProbeOutcome {
                        upstream: upstream.to_string(),
                        success: true,
                        first_successful_target: Some(target.clone()),
                        error: None,
                    };
                }
                Err(e) => {
                    debug!(upstream, target, error = %e, "Probe target failed");
                }
            }
        }

        ProbeOutcome {
            upstream: upstream.to_string(),
            success: false,
            first_successful_target: None,
            error: Some(PoolError::AllTargetsFailed.to_string()),
        }
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}
