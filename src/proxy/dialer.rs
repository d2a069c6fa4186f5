//! Upstream proxy dialing
//!
//! One dialer factory covers both upstream protocols: an HTTP CONNECT
//! handshake requiring a 200 status line, or a SOCKS5 CONNECT without
//! authentication. Either way the caller gets back an opaque TCP stream
//! to the requested target.

use crate::error::{PoolError, Result};
use crate::models::{ProxyEndpoint, ProxyProtocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

/// Largest CONNECT response head we are willing to buffer
const MAX_CONNECT_RESPONSE: usize = 1024;

pub struct UpstreamDialer;

impl UpstreamDialer {
    /// Open a connection to `target_host:target_port` through the given
    /// upstream proxy
    pub async fn connect(
        upstream: &ProxyEndpoint,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        match upstream.protocol {
            ProxyProtocol::Http => Self::connect_http(upstream, target_host, target_port).await,
            ProxyProtocol::Socks5 => Self::connect_socks5(upstream, target_host, target_port).await,
        }
    }

    /// HTTP CONNECT handshake through the upstream
    async fn connect_http(
        upstream: &ProxyEndpoint,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!(upstream = %upstream, "Dialing HTTP upstream");

        let mut stream = TcpStream::connect(upstream.authority())
            .await
            .map_err(|e| PoolError::Dial(format!("{}: {}", upstream, e)))?;

        let request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
            host = target_host,
            port = target_port
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| PoolError::Handshake(format!("send CONNECT: {}", e)))?;

        // Consume the whole response head before handing the stream
        // over; bytes past the blank line belong to the tunnel.
        let mut response = Vec::with_capacity(256);
        let mut chunk = [0u8; 256];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| PoolError::Handshake(format!("read CONNECT response: {}", e)))?;
            if n == 0 {
                return Err(PoolError::Handshake(
                    "upstream closed during CONNECT".to_string(),
                ));
            }
            response.extend_from_slice(&chunk[..n]);
            if response.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            if response.len() > MAX_CONNECT_RESPONSE {
                return Err(PoolError::Handshake(
                    "CONNECT response too large".to_string(),
                ));
            }
        }

        let head = String::from_utf8_lossy(&response);
        if !head.starts_with("HTTP/1.1 200") && !head.starts_with("HTTP/1.0 200") {
            return Err(PoolError::Handshake(format!(
                "CONNECT refused: {}",
                head.lines().next().unwrap_or("unknown error")
            )));
        }

        debug!(upstream = %upstream, "HTTP CONNECT tunnel established");
        Ok(stream)
    }

    /// SOCKS5 CONNECT through the upstream, no authentication
    async fn connect_socks5(
        upstream: &ProxyEndpoint,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!(upstream = %upstream, "Dialing SOCKS5 upstream");

        let stream = Socks5Stream::connect(
            upstream.authority().as_str(),
            (target_host, target_port),
        )
        .await
        .map_err(|e| PoolError::Handshake(format!("SOCKS5 connect failed: {}", e)))?;

        debug!(upstream = %upstream, "SOCKS5 connection established");
        Ok(stream.into_inner())
    }
}
