//! Burrow reverse-tunnel broker library
//!
//! This library provides the core components for running a burrow broker.
//! It can be used to embed a broker in other applications or for testing.

mod auth;
mod config;
mod control_plane;
mod endpoint;
mod error;
mod pairing;
mod public_plane;
mod registry;
mod relay;
mod response;
mod router;
mod session;

// Re-export public types
pub use auth::{authenticator_for, AuthError, Authenticator, OpenAuthenticator, TokenAuthenticator};
pub use config::{ResolvedServerConfig, ServerConfig, TlsFiles};
pub use control_plane::{ControlPlane, ControlSettings, CONTROL_QUEUE_DEPTH};
pub use endpoint::{
    endpoint_from_host, generate_endpoint_id, generate_request_id, is_valid_endpoint_id, normalize,
};
pub use error::{BrokerError, InvalidRequest};
pub use pairing::{PendingRequests, SlotInfo, SlotStatus, TunnelClaim, TunnelDelivery};
pub use public_plane::{read_request_head, PublicPlane, DEFAULT_HEAD_TIMEOUT};
pub use registry::SessionRegistry;
pub use relay::{relay, Direction, RelayError, RelayOptions, RelayStats};
pub use response::{write_error, write_status};
pub use router::{PublicRouter, RequestHead, MAX_HEAD_SIZE};
pub use session::{Session, SessionSettings, SessionState};
