//! Server-side TLS contexts
//!
//! This module provides the server-side TLS configuration builder.

use super::session::TlsSession;
use crate::config::TlsSettings;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use serde::Deserialize;
use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

/// Whether connecting clients must present a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientVerify {
    /// No certificate is requested
    #[default]
    None,
    /// Verified when offered, not demanded
    Optional,
    /// Handshake fails without a valid certificate
    Required,
}

impl ClientVerify {
    fn to_openssl(self) -> SslVerifyMode {
        match self {
            ClientVerify::None => SslVerifyMode::NONE,
            ClientVerify::Optional => SslVerifyMode::PEER,
            ClientVerify::Required => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("openssl: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("tls i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad tls configuration: {0}")]
    InvalidConfig(String),

    #[error("certificate: {0}")]
    Certificate(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("tls transfer failed: {0}")]
    OperationFailed(String),
}

/// Built server context, shared by every accepted connection
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    verify: ClientVerify,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Start describing a server context
    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Build a configuration from the `tls` section of the server config
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, TlsError> {
        let mut builder = TlsConfig::server()
            .cert_file(&settings.cert_file)?
            .client_verify(settings.verify);
        if let Some(key_file) = &settings.key_file {
            builder = builder.key_file(key_file)?;
        }
        if let Some(ca_file) = &settings.ca_file {
            builder = builder.ca_file(ca_file)?;
        }
        builder.build()
    }

    pub fn client_verify(&self) -> ClientVerify {
        self.verify
    }

    /// Start a non-blocking server-side session over an accepted socket
    pub fn accept(&self, stream: TcpStream) -> Result<TlsSession, TlsError> {
        TlsSession::accept(stream, self)
    }
}

/// Collects certificate material before building a [`TlsConfig`]
#[derive(Default)]
pub struct ServerConfigBuilder {
    cert: Option<X509>,
    chain: Vec<X509>,
    key: Option<PKey<Private>>,
    ca_file: Option<PathBuf>,
    verify: ClientVerify,
}

impl ServerConfigBuilder {
    /// Load the server certificate (and any chain after it) from a PEM file.
    ///
    /// A private key in the same file is picked up as well.
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, TlsError> {
        let pem = read_pem(path.as_ref())?;

        let mut certs = X509::stack_from_pem(&pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?
            .into_iter();
        let cert = certs.next().ok_or_else(|| {
            TlsError::Certificate(format!("No certificate in {}", path.as_ref().display()))
        })?;
        self.cert = Some(cert);
        self.chain = certs.collect();

        if self.key.is_none() {
            self.key = PKey::private_key_from_pem(&pem).ok();
        }
        Ok(self)
    }

    /// Load the private key from a PEM file
    pub fn key_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, TlsError> {
        let pem = read_pem(path.as_ref())?;
        let key = PKey::private_key_from_pem(&pem)
            .map_err(|e| TlsError::Certificate(format!("unreadable private key: {}", e)))?;
        self.key = Some(key);
        Ok(self)
    }

    /// CA bundle that client certificates must chain to
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, TlsError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(TlsError::InvalidConfig(format!(
                "CA file {} does not exist",
                path.display()
            )));
        }
        self.ca_file = Some(path.to_path_buf());
        Ok(self)
    }

    /// How client certificates are treated during the handshake
    pub fn client_verify(mut self, mode: ClientVerify) -> Self {
        self.verify = mode;
        self
    }

    /// Check the key against the certificate and freeze the context
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let cert = self
            .cert
            .ok_or_else(|| TlsError::InvalidConfig("no certificate configured".to_string()))?;
        let key = self
            .key
            .ok_or_else(|| TlsError::InvalidConfig("no private key configured".to_string()))?;

        let mut ctx = SslContextBuilder::new(SslMethod::tls_server())?;
        ctx.set_certificate(&cert)?;
        for extra in self.chain {
            ctx.add_extra_chain_cert(extra)?;
        }
        ctx.set_private_key(&key)?;
        ctx.check_private_key()
            .map_err(|e| TlsError::Certificate(format!("Key does not match certificate: {}", e)))?;

        if let Some(ca_file) = &self.ca_file {
            ctx.set_ca_file(ca_file)?;
        }
        if self.verify != ClientVerify::None && self.ca_file.is_none() {
            tracing::warn!("client verification enabled without a CA file");
        }
        ctx.set_verify(self.verify.to_openssl());

        Ok(TlsConfig {
            ctx: ctx.build(),
            verify: self.verify,
        })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|e| TlsError::Certificate(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::testing;

    #[test]
    fn test_server_config_from_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let files = testing::write_identity(dir.path(), "localhost");

        let config = TlsConfig::server()
            .cert_file(&files.bundle)
            .unwrap()
            .client_verify(ClientVerify::Optional)
            .build()
            .unwrap();
        assert_eq!(config.client_verify(), ClientVerify::Optional);
    }

    #[test]
    fn test_separate_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = testing::write_identity(dir.path(), "localhost");

        TlsConfig::server()
            .cert_file(&files.cert)
            .unwrap()
            .key_file(&files.key)
            .unwrap()
            .build()
            .unwrap();
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = testing::write_identity(dir.path(), "localhost");

        let err = TlsConfig::server().cert_file(&files.cert).unwrap().build().unwrap_err();
        assert!(matches!(err, TlsError::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_files() {
        assert!(matches!(
            TlsConfig::server().cert_file("/nonexistent/cert.pem"),
            Err(TlsError::Certificate(_))
        ));
        assert!(matches!(
            TlsConfig::server().ca_file("/nonexistent/ca.pem"),
            Err(TlsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_client_verify_deserialize() {
        let mode: ClientVerify = serde_yaml::from_str("required").unwrap();
        assert_eq!(mode, ClientVerify::Required);
        assert_eq!(ClientVerify::default(), ClientVerify::None);
    }
}
