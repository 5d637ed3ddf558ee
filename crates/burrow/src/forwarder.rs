use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::connector::ServerConnector;

/// Splices tunnel streams to a local TCP service
#[derive(Clone)]
pub struct LocalForwarder {
    connector: ServerConnector,
    endpoint_id: String,
    local_addr: String,
}

impl LocalForwarder {
    pub fn new(
        connector: ServerConnector,
        endpoint_id: impl Into<String>,
        local_addr: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            endpoint_id: endpoint_id.into(),
            local_addr: local_addr.into(),
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Open the tunnel stream for `request_id` and relay it to the local
    /// service until both sides are done
    pub async fn forward(&self, request_id: &str) -> Result<()> {
        let mut tunnel = self
            .connector
            .open_tunnel(&self.endpoint_id, request_id)
            .await?;

        let mut local = match TcpStream::connect(&self.local_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    "Failed to connect to local service {}: {}",
                    self.local_addr,
                    e
                );
                write_bad_gateway(&mut tunnel, &self.local_addr).await;
                return Err(e).with_context(|| format!("Local service {} unreachable", self.local_addr));
            }
        };

        let (up, down) = tokio::io::copy_bidirectional(&mut tunnel, &mut local)
            .await
            .context("Relay to local service failed")?;
        tracing::debug!(
            "Request {} done: {} bytes in, {} bytes out",
            request_id,
            up,
            down
        );
        Ok(())
    }
}

/// Answer the public caller when the local service is down
async fn write_bad_gateway<S: AsyncWrite + Unpin>(stream: &mut S, local_addr: &str) {
    let body = format!("Local service {} unreachable", local_addr);
    let response = format!(
        "HTTP/1.1 502 Bad Gateway\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
