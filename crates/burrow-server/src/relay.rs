//! Byte relay between a public connection and its tunnel stream

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Copy buffer size per direction
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound for the final best-effort shutdown of both sides
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Direction of one copy loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    PublicToTunnel,
    TunnelToPublic,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::PublicToTunnel => write!(f, "public->tunnel"),
            Direction::TunnelToPublic => write!(f, "tunnel->public"),
        }
    }
}

/// I/O failure on one side of a relay
#[derive(Debug, Error)]
#[error("{direction} copy failed: {source}")]
pub struct RelayError {
    pub direction: Direction,
    #[source]
    pub source: std::io::Error,
}

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub public_to_tunnel: u64,
    pub tunnel_to_public: u64,
    /// The relay was stopped by session closure rather than by its peers
    pub cancelled: bool,
}

/// Relay options
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOptions {
    /// Treat a direction as finished when its source stays silent this long
    pub idle_timeout: Option<Duration>,
}

/// Copy one direction until EOF, then half-close the destination
async fn copy_one_way<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    idle_timeout: Option<Duration>,
    copied: &mut u64,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let fail = |source| RelayError { direction, source };
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let read = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    tracing::debug!("Relay {} idle for {:?}, closing", direction, limit);
                    Ok(0)
                }
            },
            None => reader.read(&mut buf).await,
        };

        let n = read.map_err(fail)?;
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await.map_err(fail)?;
        writer.flush().await.map_err(fail)?;
        *copied += n as u64;
    }

    // Half-close: the other direction keeps running
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Relay {} half-close failed: {}", direction, e);
    }
    Ok(())
}

/// Splice `public` and `tunnel` together until both directions finish, one
/// of them fails, or `cancel` fires.
///
/// Both sides are shut down and dropped on every exit path.
pub async fn relay<P, T>(
    public: P,
    tunnel: T,
    cancel: &CancellationToken,
    options: RelayOptions,
) -> Result<RelayStats, RelayError>
where
    P: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut public_read, mut public_write) = tokio::io::split(public);
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

    let mut stats = RelayStats::default();

    let result = {
        let upstream = copy_one_way(
            &mut public_read,
            &mut tunnel_write,
            Direction::PublicToTunnel,
            options.idle_timeout,
            &mut stats.public_to_tunnel,
        );
        let downstream = copy_one_way(
            &mut tunnel_read,
            &mut public_write,
            Direction::TunnelToPublic,
            options.idle_timeout,
            &mut stats.tunnel_to_public,
        );

        tokio::select! {
            result = async { tokio::try_join!(upstream, downstream) } => result.map(|_| false),
            _ = cancel.cancelled() => Ok(true),
        }
    };

    // Never leave either socket half-open
    let close_both = async {
        let _ = public_write.shutdown().await;
        let _ = tunnel_write.shutdown().await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, close_both).await.is_err() {
        tracing::debug!("Relay shutdown timed out");
    }

    let cancelled = result?;
    stats.cancelled = cancelled;
    Ok(stats)
}
