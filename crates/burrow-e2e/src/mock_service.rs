//! Mock HTTP service for E2E tests
//!
//! Plays the client's local service: records what arrives through the tunnel
//! and answers with a configurable response. It can listen on a port (for the
//! real client to dial) or serve a single tunnel stream handed to it directly.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

/// A recorded HTTP request for test assertions
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    /// Request target as received (path and query)
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

struct MockState {
    requests: Vec<RecordedRequest>,
    status: StatusCode,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

/// A mock HTTP/1.1 service
#[derive(Clone)]
pub struct MockHttpService {
    addr: Option<SocketAddr>,
    state: Arc<RwLock<MockState>>,
}

impl MockHttpService {
    /// A service that is not listening anywhere; feed it streams with [`serve`]
    ///
    /// [`serve`]: MockHttpService::serve
    pub fn detached() -> Self {
        Self {
            addr: None,
            state: Arc::new(RwLock::new(MockState {
                requests: Vec::new(),
                status: StatusCode::OK,
                body: b"OK".to_vec(),
                headers: Vec::new(),
            })),
        }
    }

    /// Start a mock HTTP service on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");

        let mut service = Self::detached();
        service.addr = Some(listener.local_addr().unwrap());

        let acceptor = service.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let service = acceptor.clone();
                tokio::spawn(async move { service.serve(stream).await });
            }
        });

        service
    }

    /// Serve HTTP/1.1 on one connection until the peer closes it
    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let state = self.state.clone();
        let handler = service_fn(move |req: Request<Incoming>| {
            let state = state.clone();
            async move { Ok::<_, Infallible>(respond(&state, req).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), handler)
            .await
        {
            tracing::debug!("Mock service connection error: {}", e);
        }
    }

    /// Address as a string (e.g., "127.0.0.1:12345")
    pub fn addr_string(&self) -> String {
        self.addr
            .map(|addr| addr.to_string())
            .expect("detached mock service has no address")
    }

    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.state.read().requests.clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.read().requests.last().cloned()
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.state.write().status = status;
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        self.state.write().body = body.into();
    }

    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state
            .write()
            .headers
            .push((name.into(), value.into()));
    }
}

async fn respond(state: &RwLock<MockState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    let mut state = state.write();
    state.requests.push(RecordedRequest {
        method,
        uri,
        headers,
        body,
    });

    let mut builder = Response::builder().status(state.status);
    for (name, value) in &state.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(Bytes::from(state.body.clone())))
        .expect("valid mock response")
}
