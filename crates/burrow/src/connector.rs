use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use burrow_common::{BoxedStream, Rewind};
use burrow_protocol::{
    ChannelOpen, ClientCommand, JsonLinesCodec, ServerCommand, ServerMessage, TunnelOpenResult,
};

use crate::forwarder::LocalForwarder;

/// How long to wait for the broker's reply to a preamble or `auth`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens admin connections to the broker, plain or over TLS
#[derive(Clone)]
pub struct ServerConnector {
    server_addr: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl ServerConnector {
    /// Plain TCP connections to `server_addr`
    pub fn plain(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            tls: None,
        }
    }

    /// TLS connections verified against `ca_pem`
    ///
    /// `server_name` defaults to the host part of `server_addr`.
    pub fn tls(server_addr: impl Into<String>, ca_pem: &str, server_name: Option<&str>) -> Result<Self> {
        let server_addr = server_addr.into();
        let connector = burrow_common::tls_connector_from_pem(ca_pem)
            .context("Failed to load TLS client configuration")?;

        let name = match server_name {
            Some(name) => name.to_string(),
            None => host_of(&server_addr).to_string(),
        };
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", name))?;

        Ok(Self {
            server_addr,
            tls: Some((connector, server_name)),
        })
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Open one admin connection
    pub async fn connect(&self) -> Result<BoxedStream> {
        let tcp = TcpStream::connect(&self.server_addr)
            .await
            .with_context(|| format!("Failed to connect to {}", self.server_addr))?;
        tcp.set_nodelay(true)?;

        match &self.tls {
            Some((connector, server_name)) => {
                let tls = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .context("TLS handshake failed")?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    /// Open a tunnel stream for `request_id` and return it ready for raw bytes
    pub async fn open_tunnel(&self, endpoint_id: &str, request_id: &str) -> Result<BoxedStream> {
        let stream = self.connect().await?;
        let mut framed = Framed::new(stream, JsonLinesCodec::<TunnelOpenResult>::new());

        framed
            .send(ChannelOpen::Tunnel {
                endpoint_id: endpoint_id.to_string(),
                request_id: request_id.to_string(),
            })
            .await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .context("Timed out waiting for tunnel acceptance")?
            .context("Server closed the tunnel stream")??;

        if !reply.success {
            anyhow::bail!(
                "Tunnel for {} rejected: {}",
                request_id,
                reply.error.unwrap_or_default()
            );
        }

        let parts = framed.into_parts();
        Ok(Box::new(Rewind::new(parts.io, parts.read_buf.freeze())))
    }
}

/// Host part of `host:port` (brackets kept for IPv6 literals)
fn host_of(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(idx) if !addr[idx..].contains(']') => &addr[..idx],
        _ => addr,
    }
}

/// An authenticated control channel
pub struct TunnelClient {
    framed: Framed<BoxedStream, JsonLinesCodec<ServerMessage>>,
    endpoint_id: String,
}

impl TunnelClient {
    /// Open a control channel and authenticate with `params`
    pub async fn connect(connector: &ServerConnector, params: Value) -> Result<Self> {
        let stream = connector.connect().await?;
        let mut framed = Framed::new(stream, JsonLinesCodec::<ServerMessage>::new());

        framed.send(ChannelOpen::Control).await?;
        framed.send(ClientCommand::Auth { params }).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .context("Timed out waiting for auth result")?
            .context("Server closed the connection during auth")??;

        let result = match reply {
            ServerMessage::AuthResult(result) => result,
            other => anyhow::bail!("Expected auth result, got {:?}", other),
        };

        if !result.success {
            anyhow::bail!("Authentication failed: {}", result.error.unwrap_or_default());
        }

        let endpoint_id = result
            .endpoint_id
            .context("Auth result did not include an endpoint id")?;

        Ok(Self {
            framed,
            endpoint_id,
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Serve `new-request` pushes until the server disconnects or `shutdown`
    /// fires, in which case `end` is sent first
    pub async fn run(
        mut self,
        forwarder: LocalForwarder,
        keepalive: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let forwarder = Arc::new(forwarder);
        let mut ping = keepalive.map(tokio::time::interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Ending session {}", self.endpoint_id);
                    self.framed.send(ClientCommand::End).await?;
                    return Ok(());
                }
                _ = async {
                    match ping.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.framed.send(ClientCommand::Ping).await?;
                }
                msg = self.framed.next() => match msg {
                    None => {
                        tracing::info!("Server disconnected");
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e).context("Control channel failed"),
                    Some(Ok(ServerMessage::Command(ServerCommand::NewRequest { request_id }))) => {
                        tracing::debug!("New request {}", request_id);
                        let forwarder = forwarder.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forwarder.forward(&request_id).await {
                                tracing::warn!("Request {} failed: {:#}", request_id, e);
                            }
                        });
                    }
                    Some(Ok(ServerMessage::Command(ServerCommand::Pong))) => {
                        tracing::trace!("Pong");
                    }
                    Some(Ok(ServerMessage::AuthResult(result))) => {
                        tracing::warn!("Unexpected auth result: {:?}", result);
                    }
                },
            }
        }
    }
}
