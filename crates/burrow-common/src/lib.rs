mod error;
mod io;
mod tls;

pub use error::TlsError;
pub use io::{AsyncStream, BoxedStream, Rewind};
pub use tls::{
    load_client_config, load_client_config_from_pem, load_server_config,
    load_server_config_from_pem, load_tls_acceptor, load_tls_connector, tls_acceptor_from_pem,
    tls_connector_from_pem,
};
