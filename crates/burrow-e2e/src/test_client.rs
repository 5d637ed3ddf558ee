//! Test clients for E2E tests
//!
//! [`ControlClient`] speaks the control protocol line by line so tests can
//! drive every step by hand. [`TestClient`] runs the real `burrow` client
//! against a local service.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use burrow::{LocalForwarder, ServerConnector, TunnelClient};
use burrow_common::BoxedStream;
use burrow_protocol::{
    AuthResult, ChannelOpen, ClientCommand, JsonLinesCodec, ServerCommand, ServerMessage,
};

use crate::harness::TestServer;

/// How long tests wait for a control message before failing
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// A hand-driven control channel
pub struct ControlClient {
    framed: Framed<BoxedStream, JsonLinesCodec<ServerMessage>>,
    connector: ServerConnector,
    endpoint_id: Option<String>,
}

impl ControlClient {
    /// Connect and send the control preamble
    pub async fn connect(server: &TestServer) -> Result<Self> {
        let connector = server.connector();
        let stream = connector.connect().await?;
        let mut framed = Framed::new(stream, JsonLinesCodec::<ServerMessage>::new());
        framed.send(ChannelOpen::Control).await?;

        Ok(Self {
            framed,
            connector,
            endpoint_id: None,
        })
    }

    /// Connect and authenticate, asking for `endpoint_id` if given
    pub async fn authenticated(server: &TestServer, endpoint_id: Option<&str>) -> Result<Self> {
        let mut client = Self::connect(server).await?;
        let params = match endpoint_id {
            Some(id) => json!({ "endpointId": id }),
            None => json!({}),
        };

        let result = client.auth(params).await?;
        anyhow::ensure!(result.success, "auth failed: {:?}", result.error);
        Ok(client)
    }

    pub fn endpoint_id(&self) -> &str {
        self.endpoint_id.as_deref().unwrap_or_default()
    }

    /// Send a command
    pub async fn send(&mut self, command: ClientCommand) -> Result<()> {
        self.framed.send(command).await?;
        Ok(())
    }

    /// Send a raw line (newline appended)
    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        let stream = self.framed.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Send `auth` and wait for the result
    pub async fn auth(&mut self, params: Value) -> Result<AuthResult> {
        self.send(ClientCommand::Auth { params }).await?;
        match self.recv().await? {
            Some(ServerMessage::AuthResult(result)) => {
                if result.success {
                    self.endpoint_id = result.endpoint_id.clone();
                }
                Ok(result)
            }
            other => anyhow::bail!("Expected auth result, got {:?}", other),
        }
    }

    /// Next server message, `None` once the server closed the channel
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .context("Timed out waiting for a control message")?
        {
            Some(msg) => Ok(Some(msg?)),
            None => Ok(None),
        }
    }

    /// Wait for a `new-request` push and return its request id
    pub async fn expect_new_request(&mut self) -> Result<String> {
        loop {
            match self.recv().await? {
                Some(ServerMessage::Command(ServerCommand::NewRequest { request_id })) => {
                    return Ok(request_id)
                }
                Some(ServerMessage::Command(ServerCommand::Pong)) => continue,
                other => anyhow::bail!("Expected new-request, got {:?}", other),
            }
        }
    }

    /// True once the server has closed the channel
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match self.recv().await {
                Ok(None) | Err(_) => return true,
                Ok(Some(_)) => continue,
            }
        }
    }

    /// Open the tunnel stream for `request_id` on this session's endpoint
    pub async fn open_tunnel(&self, request_id: &str) -> Result<BoxedStream> {
        self.connector
            .open_tunnel(self.endpoint_id(), request_id)
            .await
    }

    /// Send `end`
    pub async fn end(&mut self) -> Result<()> {
        self.send(ClientCommand::End).await
    }
}

/// The real client library forwarding to a local service
pub struct TestClient {
    endpoint_id: String,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<Result<()>>>,
}

impl TestClient {
    /// Authenticate and start forwarding new requests to `local_addr`
    pub async fn connect(
        server: &TestServer,
        local_addr: &str,
        endpoint_id: Option<&str>,
    ) -> Result<Self> {
        let connector = server.connector();
        let params = match endpoint_id {
            Some(id) => json!({ "endpointId": id }),
            None => json!({}),
        };

        let client = TunnelClient::connect(&connector, params).await?;
        let endpoint_id = client.endpoint_id().to_string();
        let forwarder = LocalForwarder::new(connector, endpoint_id.clone(), local_addr);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(client.run(forwarder, None, shutdown.clone()));

        Ok(Self {
            endpoint_id,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Send `end` and wait for the client loop to finish
    pub async fn shutdown(&mut self) -> Result<()> {
        self.shutdown.cancel();
        match self.handle.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
