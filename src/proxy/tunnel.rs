//! Bidirectional byte relay between client and upstream
//!
//! No parsing happens here; gzip or TLS payloads pass through untouched.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy data in both directions until both sides have reached EOF.
///
/// Each direction propagates EOF as a write-half shutdown so the peer
/// can finish its own send. Returns (client→server, server→client) byte
/// counts, or the first I/O error.
pub async fn copy_bidirectional<C, S>(client: C, server: S) -> std::io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let client_to_server = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(client_to_server, server_to_client);
    let (sent, received) = (sent?, received?);

    debug!(
        bytes_sent = sent,
        bytes_received = received,
        "Relay closed"
    );

    Ok((sent, received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_copy_bidirectional() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut server_peer, server) = tokio::io::duplex(1024);

        let copy_handle = tokio::spawn(async move { copy_bidirectional(client, server).await });

        client_peer.write_all(b"hello from client").await.unwrap();
        client_peer.shutdown().await.unwrap();

        server_peer.write_all(b"hello from server").await.unwrap();
        server_peer.shutdown().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = server_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        let mut buf = vec![0u8; 100];
        let n = client_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from server");

        let (sent, received) = tokio::time::timeout(Duration::from_secs(1), copy_handle)
            .await
            .expect("copy_bidirectional timed out")
            .unwrap()
            .unwrap();
        assert_eq!(sent, 17);
        assert_eq!(received, 17);
    }

    #[tokio::test]
    async fn test_copy_handles_one_sided_traffic() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut server_peer, server) = tokio::io::duplex(1024);

        let copy_handle = tokio::spawn(async move { copy_bidirectional(client, server).await });

        // Only the server talks; the client just closes.
        client_peer.shutdown().await.unwrap();
        server_peer.write_all(b"payload").await.unwrap();
        server_peer.shutdown().await.unwrap();

        let mut buf = Vec::new();
        client_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload");

        let (sent, received) = copy_handle.await.unwrap().unwrap();
        assert_eq!(sent, 0);
        assert_eq!(received, 7);
    }
}
