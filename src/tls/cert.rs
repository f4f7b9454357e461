//! Peer certificate summaries
//!
//! This module extracts the fields applications usually want from a peer's
//! X.509 certificate.

use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509Ref};
use std::net::IpAddr;

/// Fields of a peer certificate exposed to request handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject common name
    pub subject: String,
    /// Issuer common name
    pub issuer: String,
    /// Subject Alternative Names, as `DNS:name` or `IP:addr`
    pub subject_alt_names: Vec<String>,
    /// Expiry as printed by OpenSSL
    pub not_after: String,
}

impl CertInfo {
    /// Summarize `cert`; missing names read as `<undef>`
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
            not_after: cert.not_after().to_string(),
        }
    }
}

fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<undef>".to_string())
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let Some(sans) = cert.subject_alt_names() else {
        return Vec::new();
    };

    sans.iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                return Some(format!("DNS:{}", dns));
            }
            let ip = match name.ipaddress()? {
                &[a, b, c, d] => IpAddr::from([a, b, c, d]),
                octets => IpAddr::from(<[u8; 16]>::try_from(octets).ok()?),
            };
            Some(format!("IP:{}", ip))
        })
        .collect()
}
