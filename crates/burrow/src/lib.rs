//! Burrow client library
//!
//! Connects to a burrow broker, registers an endpoint and splices every
//! announced public request to a local TCP service.

mod config;
mod connector;
mod forwarder;

pub use config::ClientConfig;
pub use connector::{ServerConnector, TunnelClient};
pub use forwarder::LocalForwarder;
