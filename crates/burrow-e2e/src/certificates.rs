//! Test certificate generation using rcgen
//!
//! One CA signs a server certificate that is valid for `localhost` (admin
//! listener) and for every endpoint under the test root domain (public
//! listener).

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use std::net::{IpAddr, Ipv4Addr};

/// CA plus one server certificate, all PEM encoded
#[derive(Clone)]
pub struct TestCertificates {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
}

impl TestCertificates {
    /// Generate a CA and a server certificate for `localhost` and
    /// `*.<root_domain>`
    pub fn generate(root_domain: &str) -> Self {
        let ca_key = KeyPair::generate().expect("Failed to generate CA key");

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "Burrow Test CA");
            dn.push(DnType::OrganizationName, "Burrow E2E Tests");
            dn
        };
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_cert = ca_params
            .clone()
            .self_signed(&ca_key)
            .expect("Failed to create CA cert");
        let ca_issuer = Issuer::new(ca_params, ca_key);

        let server_key = KeyPair::generate().expect("Failed to generate server key");
        let mut server_params = CertificateParams::default();
        server_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "localhost");
            dn
        };
        server_params.subject_alt_names = vec![
            SanType::DnsName("localhost".try_into().expect("valid DNS name")),
            SanType::DnsName(
                format!("*.{}", root_domain)
                    .try_into()
                    .expect("valid wildcard DNS name"),
            ),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ];
        server_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let server_cert = server_params
            .signed_by(&server_key, &ca_issuer)
            .expect("Failed to create server cert");

        Self {
            ca_cert_pem: ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
        }
    }
}
