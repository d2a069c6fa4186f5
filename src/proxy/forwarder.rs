//! Per-connection forwarding state machine
//!
//! Each accepted client connection picks an upstream from the rotator,
//! reads one HTTP request head, and relays either a CONNECT tunnel or a
//! plain HTTP exchange through that upstream. The head is buffered so a
//! single failover can re-dispatch it without re-reading the client;
//! once relaying has begun there is no failover. Every upstream attempt
//! feeds exactly one priority delta back into the store.

use crate::error::{PoolError, Result};
use crate::models::ProxyEndpoint;
use crate::proxy::dialer::UpstreamDialer;
use crate::proxy::rotator::Rotator;
use crate::proxy::tunnel;
use crate::repository::ProxyRepository;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Largest request head we are willing to buffer
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// One selection plus the original, at most one failover
const MAX_ATTEMPTS: usize = 2;

/// Raw request head plus any client bytes that arrived with it
#[derive(Debug)]
pub struct HeadBuffer {
    pub bytes: Vec<u8>,
    /// Offset just past the head terminator; the tail is body data
    pub body_start: usize,
}

impl HeadBuffer {
    pub fn head(&self) -> &[u8] {
        &self.bytes[..self.body_start]
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[self.body_start..]
    }
}

/// Read one request head (through the blank line) from the client
pub async fn read_request_head<S>(stream: &mut S) -> std::io::Result<HeadBuffer>
where
    S: AsyncRead + Unpin,
{
    let mut bytes = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed before sending a full request head",
            ));
        }

        let search_from = bytes.len().saturating_sub(3);
        bytes.extend_from_slice(&chunk[..n]);

        if let Some(pos) = bytes[search_from..]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            return Ok(HeadBuffer {
                body_start: search_from + pos + 4,
                bytes,
            });
        }

        if bytes.len() > MAX_HEAD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

/// Parsed request line and headers
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn parse(head: &[u8]) -> Result<Self> {
        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut header_storage);

        let status = request
            .parse(head)
            .map_err(|e| PoolError::ClientRequest(e.to_string()))?;
        if status.is_partial() {
            return Err(PoolError::ClientRequest(
                "truncated request head".to_string(),
            ));
        }

        let method = request
            .method
            .ok_or_else(|| PoolError::ClientRequest("missing method".to_string()))?
            .to_string();
        let target = request
            .path
            .ok_or_else(|| PoolError::ClientRequest("missing target".to_string()))?
            .to_string();
        let version = request.version.unwrap_or(1);

        let headers = request
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();

        Ok(RequestHead {
            method,
            target,
            version,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Target `(host, port)` of a plain HTTP request, derived from the
    /// Host header (or the absolute request URI) with the scheme default
    /// filled in
    pub fn resolve_plain_target(&self) -> Result<(String, u16)> {
        let scheme = if self.target.starts_with("https://") {
            "https"
        } else {
            "http"
        };

        let host = match self.header("host") {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                // Fall back to the authority of an absolute-form URI.
                let url = url::Url::parse(&self.target).map_err(|_| {
                    PoolError::ClientRequest(format!(
                        "no Host header and relative target {}",
                        self.target
                    ))
                })?;
                let host = url.host_str().ok_or_else(|| {
                    PoolError::ClientRequest("request URI has no host".to_string())
                })?;
                match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                }
            }
        };

        split_host_port(&ensure_port(&host, scheme))
    }

    /// Serialize the head for the upstream connection: the request line
    /// verbatim, the Host header forced to `host_port`, and
    /// `Accept-Encoding: gzip` on the way out
    pub fn encode_for_upstream(&self, host_port: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        out.extend_from_slice(format!("Host: {}\r\n", host_port).as_bytes());

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("accept-encoding") {
                continue;
            }
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }

        out.extend_from_slice(b"Accept-Encoding: gzip\r\n\r\n");
        out
    }
}

/// Append the scheme's default port when the host carries none
pub fn ensure_port(host: &str, scheme: &str) -> String {
    let has_port = if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal
        rest.contains("]:")
    } else {
        host.contains(':')
    };

    if has_port {
        host.to_string()
    } else if scheme == "https" {
        format!("{}:443", host)
    } else {
        format!("{}:80", host)
    }
}

/// Split `host:port`, tolerating bracketed IPv6 literals
pub fn split_host_port(authority: &str) -> Result<(String, u16)> {
    let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(|| {
            PoolError::ClientRequest(format!("bad authority {}", authority))
        })?;
        let port = rest.strip_prefix(':').ok_or_else(|| {
            PoolError::ClientRequest(format!("missing port in {}", authority))
        })?;
        (host.to_string(), port)
    } else {
        let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
            PoolError::ClientRequest(format!("missing port in {}", authority))
        })?;
        (host.to_string(), port)
    };

    let port = port_str.parse::<u16>().map_err(|_| {
        PoolError::ClientRequest(format!("invalid port in {}", authority))
    })?;

    Ok((host, port))
}

/// CONNECT authority `host:port`; bare hosts default to 443
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    if authority.contains(':') || authority.starts_with('[') {
        split_host_port(authority)
    } else {
        Ok((authority.to_string(), 443))
    }
}

enum DispatchOutcome {
    /// Relay finished cleanly
    Completed,
    /// Dial or handshake never got through; the request is untouched
    /// and eligible for failover
    DialFailed,
    /// Failure after bytes started flowing; the connection is done
    MidStreamFailed,
}

pub struct Forwarder {
    rotator: Arc<Rotator>,
    repo: ProxyRepository,
    connect_timeout: Duration,
}

impl Forwarder {
    pub fn new(rotator: Arc<Rotator>, repo: ProxyRepository, connect_timeout: Duration) -> Self {
        Self {
            rotator,
            repo,
            connect_timeout,
        }
    }

    /// Drive one client connection to completion. All failures are
    /// handled here; the connection closes when this returns.
    pub async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr) {
        let mut head_buf: Option<HeadBuffer> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let Some(upstream_url) = self.rotator.next() else {
                debug!(%peer, "No upstream proxy available, closing client connection");
                return;
            };

            let upstream = match ProxyEndpoint::parse(&upstream_url) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    // A malformed pool entry is not the client's fault and
                    // has no row identity to punish.
                    warn!(upstream = %upstream_url, error = %e, "Unparseable upstream in working set");
                    continue;
                }
            };

            debug!(%peer, upstream = %upstream, attempt, "Selected upstream");

            if head_buf.is_none() {
                match read_request_head(&mut client).await {
                    Ok(buf) => head_buf = Some(buf),
                    Err(e) => {
                        debug!(%peer, error = %e, "Failed to read client request");
                        self.punish(&upstream).await;
                        return;
                    }
                }
            }
            let buf = head_buf.as_ref().expect("request head buffered above");

            let head = match RequestHead::parse(buf.head()) {
                Ok(head) => head,
                Err(e) => {
                    debug!(%peer, error = %e, "Failed to parse client request");
                    self.punish(&upstream).await;
                    continue;
                }
            };

            let outcome = if head.is_connect() {
                self.dispatch_connect(&mut client, &upstream, &head, buf)
                    .await
            } else {
                self.dispatch_plain(&mut client, &upstream, &head, buf).await
            };

            match outcome {
                DispatchOutcome::Completed => {
                    self.reward(&upstream).await;
                    return;
                }
                DispatchOutcome::MidStreamFailed => {
                    self.punish(&upstream).await;
                    return;
                }
                DispatchOutcome::DialFailed => {
                    self.punish(&upstream).await;
                    // FAILOVER: one more selection against the buffered
                    // request.
                }
            }
        }

        debug!(%peer, "Failover exhausted, closing client connection");
    }

    /// CONNECT: tunnel the client to the requested host through the
    /// upstream
    async fn dispatch_connect(
        &self,
        client: &mut TcpStream,
        upstream: &ProxyEndpoint,
        head: &RequestHead,
        buf: &HeadBuffer,
    ) -> DispatchOutcome {
        let (target_host, target_port) = match parse_authority(&head.target) {
            Ok(target) => target,
            Err(e) => {
                debug!(error = %e, "Bad CONNECT authority");
                return DispatchOutcome::DialFailed;
            }
        };

        let mut server = match timeout(
            self.connect_timeout,
            UpstreamDialer::connect(upstream, &target_host, target_port),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(upstream = %upstream, error = %e, "CONNECT dial failed");
                return DispatchOutcome::DialFailed;
            }
            Err(_) => {
                debug!(upstream = %upstream, "CONNECT dial timed out");
                return DispatchOutcome::DialFailed;
            }
        };

        if client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .is_err()
        {
            return DispatchOutcome::MidStreamFailed;
        }

        // Bytes the client pipelined behind the CONNECT head belong to
        // the tunnel.
        if !buf.body().is_empty() && server.write_all(buf.body()).await.is_err() {
            return DispatchOutcome::MidStreamFailed;
        }

        match tunnel::copy_bidirectional(&mut *client, server).await {
            Ok(_) => DispatchOutcome::Completed,
            Err(e) => {
                debug!(upstream = %upstream, error = %e, "Tunnel I/O error");
                DispatchOutcome::MidStreamFailed
            }
        }
    }

    /// Plain HTTP: forward the buffered request through the upstream and
    /// relay the exchange
    async fn dispatch_plain(
        &self,
        client: &mut TcpStream,
        upstream: &ProxyEndpoint,
        head: &RequestHead,
        buf: &HeadBuffer,
    ) -> DispatchOutcome {
        let (target_host, target_port) = match head.resolve_plain_target() {
            Ok(target) => target,
            Err(e) => {
                debug!(error = %e, "Cannot resolve request target");
                return DispatchOutcome::DialFailed;
            }
        };

        let mut server = match timeout(
            self.connect_timeout,
            UpstreamDialer::connect(upstream, &target_host, target_port),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(upstream = %upstream, error = %e, "Upstream dial failed");
                return DispatchOutcome::DialFailed;
            }
            Err(_) => {
                debug!(upstream = %upstream, "Upstream dial timed out");
                return DispatchOutcome::DialFailed;
            }
        };

        let host_port = format!("{}:{}", target_host, target_port);
        let encoded = head.encode_for_upstream(&host_port);

        // The request is being forwarded from here on; failures no
        // longer qualify for failover.
        if server.write_all(&encoded).await.is_err() {
            return DispatchOutcome::MidStreamFailed;
        }
        if !buf.body().is_empty() && server.write_all(buf.body()).await.is_err() {
            return DispatchOutcome::MidStreamFailed;
        }

        // Remaining request body and the full response pass through
        // untouched, gzip included.
        match tunnel::copy_bidirectional(&mut *client, server).await {
            Ok(_) => DispatchOutcome::Completed,
            Err(e) => {
                debug!(upstream = %upstream, error = %e, "Relay I/O error");
                DispatchOutcome::MidStreamFailed
            }
        }
    }

    async fn reward(&self, upstream: &ProxyEndpoint) {
        if let Err(e) = self
            .repo
            .increase_priority(&upstream.host, upstream.port)
            .await
        {
            warn!(upstream = %upstream, error = %e, "Failed to raise upstream priority");
        }
    }

    async fn punish(&self, upstream: &ProxyEndpoint) {
        if let Err(e) = self
            .repo
            .decrease_priority(&upstream.host, upstream.port)
            .await
        {
            warn!(upstream = %upstream, error = %e, "Failed to lower upstream priority");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn test_read_request_head_splits_body() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        writer
            .write_all(b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();

        let buf = read_request_head(&mut reader).await.unwrap();
        assert!(buf.head().ends_with(b"\r\n\r\n"));
        assert_eq!(buf.body(), b"hello");
    }

    #[tokio::test]
    async fn test_read_request_head_across_chunks() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            writer.write_all(b"GET / HTTP/1.1\r\nHost: a\r").await.unwrap();
            tokio::task::yield_now().await;
            writer.write_all(b"\n\r\n").await.unwrap();
        });

        let buf = read_request_head(&mut reader).await.unwrap();
        assert_eq!(buf.head(), b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert!(buf.body().is_empty());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_request_head_eof() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        writer.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(writer);

        let err = read_request_head(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_parse_connect_head() {
        let head =
            RequestHead::parse(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
                .unwrap();
        assert!(head.is_connect());
        assert_eq!(head.target, "example.com:443");
        assert_eq!(
            parse_authority(&head.target).unwrap(),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn test_parse_plain_head_and_target() {
        let head = RequestHead::parse(
            b"GET http://example.org/path?q=1 HTTP/1.1\r\nHost: example.org\r\nUser-Agent: t\r\n\r\n",
        )
        .unwrap();
        assert!(!head.is_connect());
        assert_eq!(head.header("host"), Some("example.org"));
        assert_eq!(
            head.resolve_plain_target().unwrap(),
            ("example.org".to_string(), 80)
        );
    }

    #[test]
    fn test_resolve_target_without_host_header() {
        let head =
            RequestHead::parse(b"GET http://example.org:8080/ HTTP/1.1\r\nAccept: */*\r\n\r\n")
                .unwrap();
        assert_eq!(
            head.resolve_plain_target().unwrap(),
            ("example.org".to_string(), 8080)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RequestHead::parse(b"\x00\x01\x02\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn test_encode_for_upstream_rewrites_host_and_encoding() {
        let head = RequestHead::parse(
            b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\nAccept-Encoding: br\r\nX-Custom: 1\r\n\r\n",
        )
        .unwrap();

        let encoded = String::from_utf8(head.encode_for_upstream("example.org:80")).unwrap();
        assert!(encoded.starts_with("GET http://example.org/ HTTP/1.1\r\n"));
        assert!(encoded.contains("Host: example.org:80\r\n"));
        assert!(encoded.contains("X-Custom: 1\r\n"));
        assert!(encoded.contains("Accept-Encoding: gzip\r\n"));
        assert!(!encoded.contains("br"));
        assert!(encoded.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_ensure_port() {
        assert_eq!(ensure_port("example.org", "http"), "example.org:80");
        assert_eq!(ensure_port("example.org", "https"), "example.org:443");
        assert_eq!(ensure_port("example.org:8080", "http"), "example.org:8080");
        assert_eq!(ensure_port("[::1]", "http"), "[::1]:80");
        assert_eq!(ensure_port("[::1]:8080", "http"), "[::1]:8080");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.org:80").unwrap(),
            ("example.org".to_string(), 80)
        );
        assert_eq!(
            split_host_port("[::1]:8080").unwrap(),
            ("::1".to_string(), 8080)
        );
        assert!(split_host_port("example.org").is_err());
        assert!(split_host_port("example.org:notaport").is_err());
    }

    #[test]
    fn test_parse_authority_defaults_to_443() {
        assert_eq!(
            parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
    }
}
