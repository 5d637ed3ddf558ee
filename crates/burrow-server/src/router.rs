//! Public request routing: request head → endpoint id → session

use std::sync::Arc;

use crate::endpoint::{endpoint_from_host, normalize};
use crate::error::{BrokerError, InvalidRequest};
use crate::registry::SessionRegistry;
use crate::session::Session;

/// Maximum size of a public request head
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Maximum number of headers parsed from a public request head
const MAX_HEADERS: usize = 64;

/// The parts of a public request head the router looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub host: Option<String>,
    /// Size of the head in bytes, including the final CRLF
    pub len: usize,
}

impl RequestHead {
    /// Parse a request head from the start of `buf`
    ///
    /// Returns `Ok(None)` while the head is still incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, InvalidRequest> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buf.len() >= MAX_HEAD_SIZE {
                    return Err(InvalidRequest::MalformedHead(format!(
                        "request head exceeds {} bytes",
                        MAX_HEAD_SIZE
                    )));
                }
                return Ok(None);
            }
            Err(e) => return Err(InvalidRequest::MalformedHead(e.to_string())),
        };

        if len > MAX_HEAD_SIZE {
            return Err(InvalidRequest::MalformedHead(format!(
                "request head exceeds {} bytes",
                MAX_HEAD_SIZE
            )));
        }

        let host = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .map(|h| {
                std::str::from_utf8(h.value)
                    .map(|v| v.trim().to_string())
                    .map_err(|_| InvalidRequest::MalformedHead("Host is not UTF-8".into()))
            })
            .transpose()?;

        Ok(Some(Self {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            host,
            len,
        }))
    }
}

/// Routes public requests to sessions by host name
pub struct PublicRouter {
    root_domain: String,
    registry: Arc<SessionRegistry>,
}

impl PublicRouter {
    pub fn new(root_domain: impl AsRef<str>, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            root_domain: normalize(root_domain.as_ref().trim_start_matches('.')),
            registry,
        })
    }

    pub fn root_domain(&self) -> &str {
        &self.root_domain
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Validate a request head and derive its endpoint id
    ///
    /// Method and target are checked before the host, so `CONNECT` and
    /// absolute-form targets are refused whatever host they name.
    pub fn endpoint_for(&self, head: &RequestHead) -> Result<String, BrokerError> {
        if head.method.eq_ignore_ascii_case("CONNECT") {
            return Err(InvalidRequest::ConnectMethod.into());
        }

        if !head.target.starts_with('/') {
            return Err(InvalidRequest::NonRelativeTarget(head.target.clone()).into());
        }

        let host = head.host.as_deref().unwrap_or_default();
        endpoint_from_host(host, &self.root_domain)
            .ok_or_else(|| InvalidRequest::ForeignHost(host.to_string()).into())
    }

    /// Resolve the session that should carry this request
    pub fn route(&self, head: &RequestHead) -> Result<Arc<Session>, BrokerError> {
        let endpoint_id = self.endpoint_for(head)?;
        self.registry
            .lookup(&endpoint_id)
            .ok_or(BrokerError::EndpointNotFound(endpoint_id))
    }
}
