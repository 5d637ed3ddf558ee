//! Minimal HTTP/1.1 responses written by the broker itself

use hyper::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::BrokerError;

/// Write a small plain-text response and close the write side
pub async fn write_status<S>(stream: &mut S, status: StatusCode, message: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        message.len(),
        message
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Answer a public caller for a broker error, if the error maps to a status
pub async fn write_error<S>(stream: &mut S, error: &BrokerError)
where
    S: AsyncWrite + Unpin,
{
    let Some(status) = error.public_status() else {
        return;
    };
    if let Err(e) = write_status(stream, status, &error.to_string()).await {
        tracing::debug!("Failed to write {} response: {}", status, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_status() {
        let (mut near, mut far) = tokio::io::duplex(1024);
        write_status(&mut near, StatusCode::NOT_FOUND, "nope")
            .await
            .unwrap();

        let mut out = String::new();
        far.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("content-length: 4\r\n"));
        assert!(out.ends_with("\r\n\r\nnope"));
    }

    #[tokio::test]
    async fn test_write_error_uses_mapping() {
        let (mut near, mut far) = tokio::io::duplex(1024);
        write_error(&mut near, &BrokerError::SessionClosed).await;

        let mut out = String::new();
        far.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }
}
