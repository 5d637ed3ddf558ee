//! End-to-end test utilities for the burrow tunnel broker
//!
//! Runs a complete broker on ephemeral ports and provides both a hand-driven
//! control channel and the real client so tests can exercise the public,
//! admin and tunnel paths together.

pub mod certificates;
pub mod harness;
pub mod mock_service;
pub mod test_client;

pub use certificates::TestCertificates;
pub use harness::{TestServer, TestServerConfig, TEST_ROOT_DOMAIN};
pub use mock_service::{MockHttpService, RecordedRequest};
pub use test_client::{ControlClient, TestClient};
