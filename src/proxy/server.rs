//! Local proxy listener
//!
//! Accepts client connections and spawns one forwarder task per
//! connection. A per-connection failure never terminates the accept
//! loop; only the shutdown signal does.

use crate::error::Result;
use crate::proxy::forwarder::Forwarder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub struct ProxyServer {
    addr: String,
    forwarder: Arc<Forwarder>,
}

impl ProxyServer {
    pub fn new(addr: String, forwarder: Arc<Forwarder>) -> Self {
        Self { addr, forwarder }
    }

    /// Run the accept loop until the shutdown signal fires
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Proxy server listening on {}", self.addr);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let forwarder = self.forwarder.clone();
                            tokio::spawn(async move {
                                forwarder.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
