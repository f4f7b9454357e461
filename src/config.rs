//! Server configuration
//!
//! Every field has a default, so a YAML file only needs the values it
//! changes:
//!
//! ```yaml
//! host: ""
//! port: 8443
//! connection_timeout: 30
//! tls:
//!   cert_file: server.pem
//!   verify: optional
//!   ca_file: clients.pem
//! ```

use crate::ioloop::LoopConfig;
use crate::iostream::{StreamOptions, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_READ_CHUNK_SIZE};
use crate::tls::ClientVerify;
use crate::{Error, Result};

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Address families to listen on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn admits(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// Certificate material and client verification for TLS listeners
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    /// PEM certificate chain; may also hold the private key
    pub cert_file: PathBuf,
    /// PEM private key when it is not in `cert_file`
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// CA bundle used to verify client certificates
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub verify: ClientVerify,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Host name or address to bind; empty binds every interface
    pub host: String,
    pub port: u16,
    pub family: Family,
    pub backlog: i32,
    /// Close the connection after every response
    pub no_keep_alive: bool,
    /// Most bytes buffered per stream, also the largest accepted body or chunk
    pub max_buffer_size: usize,
    pub read_chunk_size: usize,
    /// Largest header block, chunk-size line or trailer block
    pub max_header_size: usize,
    /// Seconds a connection may sit idle between requests; 0 disables
    pub connection_timeout: f64,
    pub tls: Option<TlsSettings>,
    /// Warn once this many descriptors are watched
    pub poll_fd_warning: usize,
    /// Longest single poll wait, in seconds
    pub poll_max_timeout: f64,
    /// Registry name of the request handler the binary serves
    pub handler: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8888,
            family: Family::Any,
            backlog: 128,
            no_keep_alive: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_header_size: 65536,
            connection_timeout: 60.0,
            tls: None,
            poll_fd_warning: 1024,
            poll_max_timeout: 3600.0,
            handler: "hello".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_chunk_size == 0 {
            return Err(Error::Config("read_chunk_size must be positive".to_string()));
        }
        if self.read_chunk_size > self.max_buffer_size {
            return Err(Error::Config(format!(
                "read_chunk_size {} exceeds max_buffer_size {}",
                self.read_chunk_size, self.max_buffer_size
            )));
        }
        if self.max_header_size == 0 {
            return Err(Error::Config("max_header_size must be positive".to_string()));
        }
        if self.backlog <= 0 {
            return Err(Error::Config("backlog must be positive".to_string()));
        }
        if !(self.connection_timeout.is_finite() && self.connection_timeout >= 0.0) {
            return Err(Error::Config(format!(
                "invalid connection_timeout {}",
                self.connection_timeout
            )));
        }
        if !(self.poll_max_timeout.is_finite() && self.poll_max_timeout > 0.0) {
            return Err(Error::Config(format!(
                "invalid poll_max_timeout {}",
                self.poll_max_timeout
            )));
        }
        Ok(())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            max_buffer_size: self.max_buffer_size,
            read_chunk_size: self.read_chunk_size,
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            max_poll_timeout: Duration::from_secs_f64(self.poll_max_timeout),
            fd_warning_threshold: self.poll_fd_warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8888);
        assert_eq!(config.max_buffer_size, 104_857_600);
        assert!(config.tls.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ServerConfig::from_yaml_str("port: 9000\nno_keep_alive: true\nfamily: ipv6\n")
            .unwrap();
        assert_eq!(config.port, 9000);
        assert!(config.no_keep_alive);
        assert_eq!(config.family, Family::Ipv6);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.read_chunk_size, 4096);
    }

    #[test]
    fn test_tls_section() {
        let yaml = "tls:\n  cert_file: /etc/webloop/cert.pem\n  \
                    ca_file: /etc/webloop/ca.pem\n  verify: required\n";
        let tls = ServerConfig::from_yaml_str(yaml).unwrap().tls.unwrap();
        assert_eq!(tls.cert_file, PathBuf::from("/etc/webloop/cert.pem"));
        assert_eq!(tls.key_file, None);
        assert_eq!(tls.verify, ClientVerify::Required);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ServerConfig::from_yaml_str("read_chunk_size: 0").is_err());
        assert!(ServerConfig::from_yaml_str("max_buffer_size: 10\nread_chunk_size: 20").is_err());
        assert!(ServerConfig::from_yaml_str("connection_timeout: -1").is_err());
        assert!(ServerConfig::from_yaml_str("poll_max_timeout: 0").is_err());
        assert!(matches!(
            ServerConfig::from_yaml_str("colour: blue"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_derived_options() {
        let config =
            ServerConfig::from_yaml_str("poll_max_timeout: 2.5\nread_chunk_size: 1024").unwrap();
        assert_eq!(config.loop_config().max_poll_timeout, Duration::from_millis(2500));
        assert_eq!(config.stream_options().read_chunk_size, 1024);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webloop.yaml");
        std::fs::write(&path, "host: \"\"\nport: 0\n").unwrap();
        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.host, "");
        assert_eq!(config.port, 0);

        assert!(ServerConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
