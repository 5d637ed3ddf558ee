use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading TLS material
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid PEM data: {0}")]
    Pem(std::io::Error),

    #[error("No {0} found in PEM data")]
    Missing(&'static str),

    #[error("CA certificate rejected: {0}")]
    CaCertificate(rustls::Error),

    #[error("Failed to build TLS config: {0}")]
    Config(#[from] rustls::Error),
}
