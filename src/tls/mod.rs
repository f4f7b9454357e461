//! TLS support for server connections
//!
//! # Architecture
//!
//! The TLS implementation uses the session operations abstraction pattern:
//!
//! 1. `TlsConfig` holds the server identity (certificate, key, chain) and
//!    the client verification policy
//! 2. `TlsSession` implements the `SessionOps` trait for encrypted I/O and
//!    runs the handshake one non-blocking step at a time
//! 3. `IoStream` and everything above it stays unchanged; it only sees a
//!    session that reports `is_handshaking()` until the handshake is done
//!
//! # Example
//!
//! ```no_run
//! use webloop::tls::{ClientVerify, TlsConfig};
//!
//! let tls_config = TlsConfig::server()
//!     .cert_file("server.pem")
//!     .unwrap()
//!     .client_verify(ClientVerify::Optional)
//!     .ca_file("clients-ca.pem")
//!     .unwrap()
//!     .build()
//!     .unwrap();
//! # let _ = tls_config;
//! ```

pub mod cert;
pub mod config;
pub mod session;

pub use cert::CertInfo;
pub use config::{ClientVerify, ServerConfigBuilder, TlsConfig, TlsError};
pub use session::TlsSession;
