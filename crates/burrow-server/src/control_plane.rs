use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

use burrow_common::{AsyncStream, Rewind};
use burrow_protocol::{
    AuthResult, ChannelOpen, ClientCommand, CodecError, JsonLinesCodec, ServerMessage,
    TunnelOpenResult, DEFAULT_MAX_LINE_LENGTH,
};

use crate::auth::Authenticator;
use crate::error::BrokerError;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionSettings};

/// Outbound control messages buffered per session
pub const CONTROL_QUEUE_DEPTH: usize = 64;

/// Limits applied to admin connections
#[derive(Debug, Clone, Copy)]
pub struct ControlSettings {
    /// Time allowed from connect until the preamble and `auth` arrive
    pub auth_timeout: Duration,
    /// Maximum length of one JSON line
    pub max_line_length: usize,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(30),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

type PreambleFramed<S> = Framed<S, JsonLinesCodec<ChannelOpen>>;
type ControlFramed<S> = Framed<S, JsonLinesCodec<ClientCommand>>;

/// Admin listener: control channels and tunnel streams from clients
pub struct ControlPlane {
    registry: Arc<SessionRegistry>,
    authenticator: Arc<dyn Authenticator>,
    /// Optional TLS acceptor for the admin listener
    tls_acceptor: Option<TlsAcceptor>,
    control: ControlSettings,
    session: SessionSettings,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<SessionRegistry>,
        authenticator: Arc<dyn Authenticator>,
        tls_acceptor: Option<TlsAcceptor>,
        control: ControlSettings,
        session: SessionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            authenticator,
            tls_acceptor,
            control,
            session,
        })
    }

    /// Start listening for client connections
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve client connections on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Control plane listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("Admin connection from {}", peer_addr);
            let this = self.clone();

            tokio::spawn(async move {
                let result = match this.tls_acceptor.clone() {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => this.handle_stream(tls_stream, peer_addr).await,
                        Err(e) => {
                            tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e);
                            return;
                        }
                    },
                    None => this.handle_stream(stream, peer_addr).await,
                };

                if let Err(e) = result {
                    tracing::warn!("Connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }

    /// Read the preamble line and dispatch to the control or tunnel handler
    pub async fn handle_stream<S>(&self, stream: S, peer_addr: SocketAddr) -> Result<(), BrokerError>
    where
        S: AsyncStream + 'static,
    {
        let deadline = Instant::now() + self.control.auth_timeout;
        let mut framed = Framed::new(
            stream,
            JsonLinesCodec::<ChannelOpen>::with_max_length(self.control.max_line_length),
        );

        let open = match tokio::time::timeout_at(deadline, framed.next()).await {
            Err(_) => return Err(BrokerError::AuthTimeout(self.control.auth_timeout)),
            Ok(None) => {
                tracing::debug!("Connection from {} closed before its preamble", peer_addr);
                return Ok(());
            }
            Ok(Some(Err(e))) => return Err(codec_failure(e)),
            Ok(Some(Ok(open))) => open,
        };

        match open {
            ChannelOpen::Control => {
                let max_line_length = self.control.max_line_length;
                let framed =
                    framed.map_codec(|_| JsonLinesCodec::<ClientCommand>::with_max_length(max_line_length));
                self.run_control(framed, peer_addr, deadline).await
            }
            ChannelOpen::Tunnel {
                endpoint_id,
                request_id,
            } => self.attach_tunnel(framed, &endpoint_id, &request_id).await,
        }
    }

    /// Drive one control channel from `auth` to teardown
    async fn run_control<S>(
        &self,
        mut framed: ControlFramed<S>,
        peer_addr: SocketAddr,
        auth_deadline: Instant,
    ) -> Result<(), BrokerError>
    where
        S: AsyncStream + 'static,
    {
        let params = match tokio::time::timeout_at(auth_deadline, framed.next()).await {
            Err(_) => {
                tracing::info!("Client {} did not authenticate in time", peer_addr);
                let _ = framed.send(ServerMessage::from(AuthResult::denied("auth timeout"))).await;
                return Err(BrokerError::AuthTimeout(self.control.auth_timeout));
            }
            Ok(None) | Ok(Some(Ok(ClientCommand::End))) => {
                tracing::debug!("Client {} left before authenticating", peer_addr);
                return Ok(());
            }
            Ok(Some(Ok(ClientCommand::Auth { params }))) => params,
            Ok(Some(Ok(other))) => {
                let error =
                    BrokerError::ProtocolViolation(format!("expected auth, got {:?}", other));
                let _ = framed.send(ServerMessage::from(AuthResult::denied(error.to_string()))).await;
                return Err(error);
            }
            Ok(Some(Err(e))) => return Err(codec_failure(e)),
        };

        let authenticated =
            tokio::time::timeout_at(auth_deadline, self.authenticator.authenticate(&params)).await;
        let endpoint_id = match authenticated {
            Ok(Ok(endpoint_id)) => endpoint_id,
            Ok(Err(e)) => {
                let error = BrokerError::AuthFailed(e);
                let _ = framed.send(ServerMessage::from(AuthResult::denied(error.to_string()))).await;
                return Err(error);
            }
            Err(_) => {
                tracing::info!("Authentication of {} did not finish in time", peer_addr);
                let _ = framed.send(ServerMessage::from(AuthResult::denied("auth timeout"))).await;
                return Err(BrokerError::AuthTimeout(self.control.auth_timeout));
            }
        };

        let (tx, mut rx) = mpsc::channel::<ServerMessage>(CONTROL_QUEUE_DEPTH);
        let session = Session::new(endpoint_id, tx, self.session);
        session.activate();

        if let Err(e) = self.registry.register(session.clone()) {
            session.close();
            let _ = framed.send(ServerMessage::from(AuthResult::denied(e.to_string()))).await;
            return Err(e);
        }

        // The auth result goes out before the writer task can emit new-request
        if let Err(e) = framed
            .send(ServerMessage::from(AuthResult::granted(session.endpoint_id())))
            .await
        {
            self.registry.deregister_session(&session);
            session.close();
            return Err(codec_failure(e));
        }

        tracing::info!(
            "Client {} authenticated as endpoint {}",
            peer_addr,
            session.endpoint_id()
        );

        let (mut sink, mut stream) = framed.split::<ServerMessage>();

        let writer = {
            let session = session.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = sink.send(msg).await {
                        tracing::warn!(
                            "Failed to write to control channel of {}: {}",
                            session.endpoint_id(),
                            e
                        );
                        session.close();
                        break;
                    }
                }
            })
        };

        let result = loop {
            tokio::select! {
                _ = session.closed() => break Ok(()),
                msg = stream.next() => match msg {
                    None => {
                        tracing::info!("Client {} disconnected", peer_addr);
                        break Ok(());
                    }
                    Some(Ok(ClientCommand::End)) => {
                        tracing::info!("Client {} ended its session", peer_addr);
                        break Ok(());
                    }
                    Some(Ok(ClientCommand::Ping)) => {
                        if session.send(ServerMessage::pong()).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(Ok(ClientCommand::Auth { .. })) => {
                        break Err(BrokerError::ProtocolViolation(
                            "auth on an authenticated channel".into(),
                        ));
                    }
                    Some(Err(e)) => break Err(codec_failure(e)),
                },
            }
        };

        self.registry.deregister_session(&session);
        session.close();
        writer.abort();

        result
    }

    /// Hand a client-opened tunnel stream to the request waiting for it
    async fn attach_tunnel<S>(
        &self,
        mut framed: PreambleFramed<S>,
        endpoint_id: &str,
        request_id: &str,
    ) -> Result<(), BrokerError>
    where
        S: AsyncStream + 'static,
    {
        let claim = match self.registry.lookup(endpoint_id) {
            Some(session) => session.accept_tunnel(request_id),
            None => Err(BrokerError::EndpointNotFound(endpoint_id.to_string())),
        };

        let claim = match claim {
            Ok(claim) => claim,
            Err(e) => {
                tracing::debug!("Rejected tunnel stream for {}/{}: {}", endpoint_id, request_id, e);
                let _ = framed.send(TunnelOpenResult::rejected(e.to_string())).await;
                return Err(e);
            }
        };

        if let Err(e) = framed.send(TunnelOpenResult::accepted()).await {
            let e = codec_io(e);
            claim.fail(BrokerError::Io(io::Error::new(e.kind(), e.to_string())));
            return Err(BrokerError::Io(e));
        }

        // Keep whatever the client sent right after its preamble
        let parts = framed.into_parts();
        let stream = Rewind::new(parts.io, parts.read_buf.freeze());

        if !claim.deliver(Box::new(stream)) {
            tracing::debug!("Request {} went away before its tunnel arrived", request_id);
        }
        Ok(())
    }
}

/// Map a codec failure on an admin connection to a broker error
fn codec_failure(e: CodecError) -> BrokerError {
    match e {
        CodecError::Io(e) => BrokerError::Io(e),
        other => BrokerError::ProtocolViolation(other.to_string()),
    }
}

fn codec_io(e: CodecError) -> io::Error {
    match e {
        CodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}
