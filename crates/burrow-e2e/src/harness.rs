//! Test server harness for E2E tests
//!
//! Starts a complete broker (admin and public listeners) on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use burrow::ServerConnector;
use burrow_server::{
    authenticator_for, ControlPlane, ControlSettings, PublicPlane, PublicRouter, SessionRegistry,
    SessionSettings, DEFAULT_HEAD_TIMEOUT,
};

use crate::certificates::TestCertificates;

/// Root domain every test server answers for
pub const TEST_ROOT_DOMAIN: &str = "e.localhost";

/// Knobs for a test server
#[derive(Clone, Default)]
pub struct TestServerConfig {
    pub session: SessionSettings,
    pub control: ControlSettings,
    pub auth_tokens: Vec<String>,
    /// Serve both listeners over TLS with these certificates
    pub tls: Option<TestCertificates>,
    /// Number of public listeners; zero means one
    pub public_listeners: usize,
    /// Head read deadline on the public side; `None` means the default
    pub head_timeout: Option<Duration>,
}

/// A running test server instance
pub struct TestServer {
    /// Admin listener address (control channels and tunnel streams)
    pub admin_addr: SocketAddr,
    /// First public listener address
    pub public_addr: SocketAddr,
    /// Every public listener address, `public_addr` first
    pub public_addrs: Vec<SocketAddr>,
    /// Root domain for the test server
    pub root_domain: String,
    /// Registry, for assertions
    pub registry: Arc<SessionRegistry>,
    /// Certificates when TLS is on
    pub certs: Option<TestCertificates>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Start a plain-TCP test server with default settings
    pub async fn start() -> Self {
        Self::start_with(TestServerConfig::default()).await
    }

    /// Start a test server with custom settings
    pub async fn start_with(config: TestServerConfig) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let tls_acceptor = config.tls.as_ref().map(|certs| {
            burrow_common::tls_acceptor_from_pem(&certs.server_cert_pem, &certs.server_key_pem)
                .expect("Failed to load server TLS config")
        });

        let registry = SessionRegistry::new();
        let router = PublicRouter::new(TEST_ROOT_DOMAIN, registry.clone());

        let control_plane = ControlPlane::new(
            registry.clone(),
            authenticator_for(&config.auth_tokens),
            tls_acceptor.clone(),
            config.control,
            config.session,
        );
        let public_plane = PublicPlane::new(
            router,
            tls_acceptor,
            config.head_timeout.unwrap_or(DEFAULT_HEAD_TIMEOUT),
        );

        // Bind to ephemeral ports
        let admin_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind admin listener");
        let admin_addr = admin_listener.local_addr().unwrap();

        let mut public_listeners = JoinSet::new();
        let mut public_addrs = Vec::new();
        for _ in 0..config.public_listeners.max(1) {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .expect("Failed to bind public listener");
            public_addrs.push(listener.local_addr().unwrap());
            public_listeners.spawn(public_plane.clone().run_with_listener(listener));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let shutdown_registry = registry.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = control_plane.run_with_listener(admin_listener) => {
                    if let Err(e) = result {
                        tracing::error!("Control plane error: {}", e);
                    }
                }
                Some(result) = public_listeners.join_next() => {
                    tracing::error!("Public plane stopped: {:?}", result);
                }
                _ = shutdown_rx => {
                    tracing::debug!("Test server shutting down");
                }
            }
            public_listeners.abort_all();
            shutdown_registry.shutdown();
        });

        Self {
            admin_addr,
            public_addr: public_addrs[0],
            public_addrs,
            root_domain: TEST_ROOT_DOMAIN.to_string(),
            registry,
            certs: config.tls,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Connector for the admin listener, with TLS when the server uses it
    pub fn connector(&self) -> ServerConnector {
        let addr = self.admin_addr.to_string();
        match &self.certs {
            Some(certs) => ServerConnector::tls(addr, &certs.ca_cert_pem, Some("localhost"))
                .expect("Failed to build TLS connector"),
            None => ServerConnector::plain(addr),
        }
    }

    /// Get the Host header value for an endpoint
    pub fn host_for(&self, endpoint_id: &str) -> String {
        format!("{}.{}", endpoint_id, self.root_domain)
    }

    /// Plain `http://` URL of the public listener
    pub fn public_url(&self, path: &str) -> String {
        format!("http://{}{}", self.public_addr, path)
    }

    /// An HTTP client that talks to the public listener directly
    pub fn http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to build HTTP client")
    }

    /// Write raw bytes to the public listener and read until it closes
    pub async fn raw_request(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.public_addr)
            .await
            .expect("Failed to connect to public listener");
        stream.write_all(request).await.expect("write request");

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(15), stream.read_to_end(&mut response))
            .await
            .expect("Timed out waiting for the public response")
            .expect("read response");
        response
    }

    /// Wait until the registry holds (or stops holding) an endpoint
    pub async fn wait_for_endpoint(&self, endpoint_id: &str, present: bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.registry.lookup(endpoint_id).is_some() != present {
            assert!(
                tokio::time::Instant::now() < deadline,
                "endpoint {} never became {}",
                endpoint_id,
                if present { "registered" } else { "unregistered" }
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Shutdown the test server
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
