use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

use crate::auth::AuthError;
use crate::relay::RelayError;

/// Why a public request was refused before reaching any session
#[derive(Debug, Error)]
pub enum InvalidRequest {
    #[error("CONNECT is not supported on public endpoints")]
    ConnectMethod,

    #[error("Request target is not a relative path: {0}")]
    NonRelativeTarget(String),

    #[error("Host is not under the root domain: {0:?}")]
    ForeignHost(String),

    #[error("Malformed request head: {0}")]
    MalformedHead(String),
}

/// Errors raised by the broker core
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("No auth command received within {0:?}")]
    AuthTimeout(Duration),

    #[error("Authentication failed: {0}")]
    AuthFailed(#[from] AuthError),

    #[error("Endpoint already in use: {0}")]
    DuplicateEndpoint(String),

    #[error("No tunnel for endpoint: {0}")]
    EndpointNotFound(String),

    #[error("Invalid public request: {0}")]
    InvalidPublicRequest(#[from] InvalidRequest),

    #[error("No tunnel stream for request {0} within {1:?}")]
    PairingTimeout(String, Duration),

    #[error("Session closed")]
    SessionClosed,

    #[error("Too many pending requests (limit {0})")]
    TooManyPendingRequests(usize),

    #[error("Public caller hung up before request {0} was paired")]
    CallerGone(String),

    #[error("No complete request head within {0:?}")]
    HeadTimeout(Duration),

    #[error("Unknown or already paired request: {0}")]
    UnknownRequest(String),

    #[error("Relay failed: {0}")]
    RelayIo(#[from] RelayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Status to answer a public caller with, if this error is surfaced to one
    pub fn public_status(&self) -> Option<StatusCode> {
        let status = match self {
            BrokerError::InvalidPublicRequest(InvalidRequest::ConnectMethod) => {
                StatusCode::METHOD_NOT_ALLOWED
            }
            BrokerError::InvalidPublicRequest(InvalidRequest::ForeignHost(_))
            | BrokerError::EndpointNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::InvalidPublicRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::PairingTimeout(..) => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::TooManyPendingRequests(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::SessionClosed | BrokerError::UnknownRequest(_) | BrokerError::Io(_) => {
                StatusCode::BAD_GATEWAY
            }
            BrokerError::HeadTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            // Bytes may already have reached the caller
            BrokerError::RelayIo(_) => return None,
            // Nobody left to answer
            BrokerError::CallerGone(_) => return None,
            BrokerError::ProtocolViolation(_)
            | BrokerError::AuthTimeout(_)
            | BrokerError::AuthFailed(_)
            | BrokerError::DuplicateEndpoint(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Some(status)
    }
}
