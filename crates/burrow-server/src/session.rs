use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use burrow_common::{BoxedStream, Rewind};
use burrow_protocol::ServerMessage;

use crate::endpoint::generate_request_id;
use crate::error::BrokerError;
use crate::pairing::{PendingRequests, SlotInfo, SlotStatus, TunnelClaim, TunnelDelivery};
use crate::relay::{relay, RelayOptions, RelayStats};
use crate::response::write_error;

/// Bytes kept from a public caller while its request waits for a tunnel
const MAX_EARLY_BYTES: usize = 64 * 1024;

/// Per-session limits and timeouts
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// How long a public request waits for its tunnel stream
    pub pairing_timeout: Duration,
    /// Concurrent public requests per session (waiting + relaying)
    pub max_pending_requests: usize,
    /// Optional idle limit for relays
    pub relay_idle_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(10),
            max_pending_requests: 256,
            relay_idle_timeout: None,
        }
    }
}

/// Lifecycle of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAuth,
    Active,
    Closed,
}

struct SessionInner {
    state: SessionState,
    pending: PendingRequests,
}

/// One authenticated client tunnel
///
/// The control task owns the channel itself; the session keeps the queue
/// feeding its writer, the pending pairings and the cancellation token that
/// stops everything still running when the session closes.
pub struct Session {
    endpoint_id: String,
    control_tx: mpsc::Sender<ServerMessage>,
    inner: Mutex<SessionInner>,
    closed: CancellationToken,
    settings: SessionSettings,
}

impl Session {
    pub fn new(
        endpoint_id: impl Into<String>,
        control_tx: mpsc::Sender<ServerMessage>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint_id: endpoint_id.into(),
            control_tx,
            inner: Mutex::new(SessionInner {
                state: SessionState::AwaitingAuth,
                pending: PendingRequests::new(),
            }),
            closed: CancellationToken::new(),
            settings,
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// `AwaitingAuth → Active`. Returns `false` from any other state.
    pub fn activate(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::AwaitingAuth {
            return false;
        }
        inner.state = SessionState::Active;
        true
    }

    /// Move to `Closed`: fail waiting requests, stop running relays
    ///
    /// Idempotent. Returns the number of requests that were still pending.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return 0;
            }
            inner.state = SessionState::Closed;
            inner.pending.drain()
        };
        self.closed.cancel();

        if dropped > 0 {
            tracing::info!(
                "Session {} closed with {} pending request(s)",
                self.endpoint_id,
                dropped
            );
        }
        dropped
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queue a message for the control channel writer
    pub async fn send(&self, message: ServerMessage) -> Result<(), BrokerError> {
        self.control_tx
            .send(message)
            .await
            .map_err(|_| BrokerError::SessionClosed)
    }

    /// Pending requests in arrival order
    pub fn pending_requests(&self) -> Vec<SlotInfo> {
        self.inner.lock().pending.snapshot()
    }

    /// Match an arriving tunnel stream to a pending request
    pub fn accept_tunnel(&self, request_id: &str) -> Result<TunnelClaim, BrokerError> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return Err(BrokerError::SessionClosed);
        }
        inner.pending.claim(request_id)
    }

    /// Reserve a slot with a fresh request id
    fn open_slot(
        &self,
        deadline: Instant,
    ) -> Result<(String, oneshot::Receiver<TunnelDelivery>), BrokerError> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return Err(BrokerError::SessionClosed);
        }
        if inner.pending.len() >= self.settings.max_pending_requests {
            return Err(BrokerError::TooManyPendingRequests(
                self.settings.max_pending_requests,
            ));
        }

        loop {
            let request_id = generate_request_id();
            if let Some(rx) = inner.pending.insert(&request_id, deadline) {
                return Ok((request_id, rx));
            }
        }
    }

    fn finish(&self, request_id: &str, status: SlotStatus) {
        if let Some(info) = self.inner.lock().pending.finish(request_id, status) {
            tracing::debug!(
                "Request {} on {} finished as {:?} after {:?}",
                request_id,
                self.endpoint_id,
                info.status,
                info.created_at.elapsed()
            );
        }
    }

    /// Announce a reserved request and wait for the client's tunnel stream
    async fn pair(
        &self,
        request_id: &str,
        mut rx: oneshot::Receiver<TunnelDelivery>,
        deadline: Instant,
    ) -> Result<BoxedStream, BrokerError> {
        let timeout = self.settings.pairing_timeout;
        tracing::debug!("New request {} for {}", request_id, self.endpoint_id);

        let announce = tokio::time::timeout_at(
            deadline,
            self.send(ServerMessage::new_request(request_id.to_string())),
        )
        .await;
        match announce {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.finish(request_id, SlotStatus::Failed);
                return Err(e);
            }
            Err(_) => {
                if self.inner.lock().pending.expire(request_id) {
                    return Err(BrokerError::PairingTimeout(request_id.to_string(), timeout));
                }
            }
        }

        let delivery = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(delivery) => delivery,
            Err(_) => {
                if self.inner.lock().pending.expire(request_id) {
                    tracing::warn!(
                        "Request {} for {} timed out waiting for a tunnel stream",
                        request_id,
                        self.endpoint_id
                    );
                    return Err(BrokerError::PairingTimeout(request_id.to_string(), timeout));
                }
                // Claimed just before the deadline: the claimer decides
                rx.await
            }
        };

        match delivery {
            Ok(Ok(tunnel)) => Ok(tunnel),
            Ok(Err(e)) => {
                self.finish(request_id, SlotStatus::Failed);
                Err(e)
            }
            Err(_) => {
                self.finish(request_id, SlotStatus::Failed);
                Err(BrokerError::SessionClosed)
            }
        }
    }

    /// Tunnel one public connection through this session
    ///
    /// Emits `new-request`, waits for the matching tunnel stream and relays
    /// bytes until either side closes. Pairing failures are answered on the
    /// public side (504 on timeout, 502 when the session goes away, 503 when
    /// the session is at capacity). The public stream is closed on return.
    ///
    /// While waiting, the public side is watched: bytes it sends are kept and
    /// relayed first, and a caller that hangs up releases its slot at once.
    pub async fn start_request<P>(&self, mut public: P) -> Result<RelayStats, BrokerError>
    where
        P: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + self.settings.pairing_timeout;
        let (request_id, rx) = match self.open_slot(deadline) {
            Ok(slot) => slot,
            Err(e) => {
                write_error(&mut public, &e).await;
                return Err(e);
            }
        };

        let mut early = BytesMut::new();
        let paired = {
            let pairing = self.pair(&request_id, rx, deadline);
            tokio::pin!(pairing);

            loop {
                tokio::select! {
                    biased;
                    paired = &mut pairing => break paired,
                    read = public.read_buf(&mut early), if early.len() < MAX_EARLY_BYTES => {
                        match read {
                            Ok(0) | Err(_) => break Err(BrokerError::CallerGone(request_id.clone())),
                            Ok(_) => {}
                        }
                    }
                }
            }
        };

        let tunnel = match paired {
            Ok(tunnel) => tunnel,
            Err(e @ BrokerError::CallerGone(_)) => {
                self.finish(&request_id, SlotStatus::Failed);
                return Err(e);
            }
            Err(e) => {
                write_error(&mut public, &e).await;
                return Err(e);
            }
        };

        tracing::debug!("Request {} paired, relaying", request_id);

        let options = RelayOptions {
            idle_timeout: self.settings.relay_idle_timeout,
        };
        let public = Rewind::new(public, early.freeze());
        let result = relay(public, tunnel, &self.closed, options).await;

        match result {
            Ok(stats) => {
                self.finish(&request_id, SlotStatus::Done);
                tracing::debug!(
                    "Request {} relayed {} bytes up, {} bytes down",
                    request_id,
                    stats.public_to_tunnel,
                    stats.tunnel_to_public
                );
                Ok(stats)
            }
            Err(e) => {
                self.finish(&request_id, SlotStatus::Failed);
                Err(e.into())
            }
        }
    }
}
