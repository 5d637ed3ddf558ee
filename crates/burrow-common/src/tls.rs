//! PEM loading for the admin and public listeners and for clients
//!
//! Every loader exists twice: from files (deployment) and from PEM strings
//! (tests generate certificates in memory). The `tls_*` helpers wrap the
//! configs in the tokio acceptor and connector the listeners and the client
//! actually use.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::TlsError;

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(reader: &mut dyn BufRead) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Pem)?;
    if certs.is_empty() {
        return Err(TlsError::Missing("certificate"));
    }
    Ok(certs)
}

fn read_key(reader: &mut dyn BufRead) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(reader)
        .map_err(TlsError::Pem)?
        .ok_or(TlsError::Missing("private key"))
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TlsError> {
    Ok(ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?)
}

fn client_config(ca_certs: Vec<CertificateDer<'static>>) -> Result<ClientConfig, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert).map_err(TlsError::CaCertificate)?;
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Server TLS config for a listener (admin or public)
///
/// Clients authenticate through the `auth` command, so no client
/// certificate is requested.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsError> {
    let certs = read_certs(&mut open(cert_path)?)?;
    let key = read_key(&mut open(key_path)?)?;
    server_config(certs, key)
}

pub fn load_server_config_from_pem(cert_pem: &str, key_pem: &str) -> Result<ServerConfig, TlsError> {
    let certs = read_certs(&mut cert_pem.as_bytes())?;
    let key = read_key(&mut key_pem.as_bytes())?;
    server_config(certs, key)
}

/// Client TLS config trusting only the CA(s) in `ca_path`
pub fn load_client_config(ca_path: &Path) -> Result<ClientConfig, TlsError> {
    client_config(read_certs(&mut open(ca_path)?)?)
}

pub fn load_client_config_from_pem(ca_pem: &str) -> Result<ClientConfig, TlsError> {
    client_config(read_certs(&mut ca_pem.as_bytes())?)
}

/// Acceptor for a listener serving the certificate chain in `cert_path`
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let config = load_server_config(cert_path, key_path)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub fn tls_acceptor_from_pem(cert_pem: &str, key_pem: &str) -> Result<TlsAcceptor, TlsError> {
    let config = load_server_config_from_pem(cert_pem, key_pem)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector trusting only the CA(s) in `ca_path`
pub fn load_tls_connector(ca_path: &Path) -> Result<TlsConnector, TlsError> {
    let config = load_client_config(ca_path)?;
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn tls_connector_from_pem(ca_pem: &str) -> Result<TlsConnector, TlsError> {
    let config = load_client_config_from_pem(ca_pem)?;
    Ok(TlsConnector::from(Arc::new(config)))
}
