use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use burrow_common::Rewind;

use crate::error::{BrokerError, InvalidRequest};
use crate::response::write_error;
use crate::router::{PublicRouter, RequestHead, MAX_HEAD_SIZE};

/// Default time a public connection gets to deliver its request head
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Public listener: accepts HTTP/1.x connections and tunnels each one to the
/// session named by its host
pub struct PublicPlane {
    router: Arc<PublicRouter>,
    /// Optional TLS acceptor for HTTPS mode
    tls_acceptor: Option<TlsAcceptor>,
    head_timeout: Duration,
}

impl PublicPlane {
    pub fn new(
        router: Arc<PublicRouter>,
        tls_acceptor: Option<TlsAcceptor>,
        head_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            tls_acceptor,
            head_timeout,
        })
    }

    /// Start listening for public traffic
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve public traffic on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        if self.tls_acceptor.is_some() {
            tracing::info!("HTTPS plane listening on {}", addr);
        } else {
            tracing::info!("HTTP plane listening on {}", addr);
        }

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("Public connection from {}", peer_addr);
            let this = self.clone();

            tokio::spawn(async move {
                if let Some(ref acceptor) = this.tls_acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => this.serve_connection(tls_stream, peer_addr).await,
                        Err(e) => {
                            tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        }
                    }
                } else {
                    this.serve_connection(stream, peer_addr).await;
                }
            });
        }
    }

    /// Route one public connection and tunnel it for its whole lifetime
    pub async fn serve_connection<S>(&self, mut stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read = tokio::time::timeout(self.head_timeout, read_request_head(&mut stream)).await;
        let (head, buffered) = match read {
            Ok(Ok(Some(read))) => read,
            Ok(Ok(None)) => {
                tracing::debug!("Connection from {} closed before a request", peer_addr);
                return;
            }
            Err(_) => {
                let e = BrokerError::HeadTimeout(self.head_timeout);
                tracing::debug!("Slow request from {}: {}", peer_addr, e);
                write_error(&mut stream, &e).await;
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!("Bad request from {}: {}", peer_addr, e);
                write_error(&mut stream, &e).await;
                return;
            }
        };

        tracing::debug!(
            "Public request: {} {} (Host: {:?})",
            head.method,
            head.target,
            head.host
        );

        let session = match self.router.route(&head) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("Rejected request from {}: {}", peer_addr, e);
                write_error(&mut stream, &e).await;
                return;
            }
        };

        // Head bytes (and anything read past them) go through unmodified
        let public = Rewind::new(stream, buffered.freeze());
        match session.start_request(public).await {
            Ok(_) => {}
            Err(BrokerError::RelayIo(e)) => {
                tracing::debug!("Relay for {} ended with error: {}", peer_addr, e);
            }
            Err(e @ BrokerError::CallerGone(_)) => {
                tracing::debug!("{} ({})", e, peer_addr);
            }
            Err(e) => {
                tracing::warn!(
                    "Request from {} to {} failed: {}",
                    peer_addr,
                    session.endpoint_id(),
                    e
                );
            }
        }
    }
}

/// Read until a complete request head is buffered
///
/// Returns the parsed head with every byte read so far, or `None` if the
/// peer closed the connection before sending anything.
pub async fn read_request_head<S>(
    stream: &mut S,
) -> Result<Option<(RequestHead, BytesMut)>, BrokerError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(InvalidRequest::MalformedHead(format!(
                "request head exceeds {} bytes",
                MAX_HEAD_SIZE
            ))
            .into());
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(
                InvalidRequest::MalformedHead("connection closed mid-head".into()).into(),
            );
        }

        if let Some(head) = RequestHead::parse(&buf)? {
            return Ok(Some((head, buf)));
        }
    }
}
