//! Error types shared by the event loop, streams and the HTTP layer.

use std::os::fd::RawFd;

/// Result type for webloop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the loop, streams, connections and server
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::tls::TlsError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("A read is already pending on this stream")]
    ReadPending,

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Read buffer exceeded {0} bytes")]
    BufferFull(usize),

    #[error("No match within {0} bytes")]
    LimitExceeded(usize),

    #[error("Event loop is running")]
    LoopRunning,

    #[error("Event loop is closed")]
    LoopClosed,

    #[error("No request in flight")]
    NoRequest,

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors caused by what the peer sent rather than by local state
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::InvalidVersion(_)
                | Error::InvalidMethod(_)
                | Error::InvalidHeader(_)
                | Error::InvalidChunkSize(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_classification() {
        assert!(Error::Parse("x".into()).is_protocol());
        assert!(Error::InvalidVersion("HTTP/1.0".into()).is_protocol());
        assert!(!Error::StreamClosed.is_protocol());
        assert!(!Error::ReadPending.is_protocol());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::AlreadyRegistered(7).to_string(),
            "Descriptor 7 is already registered"
        );
        assert_eq!(Error::LimitExceeded(10).to_string(), "No match within 10 bytes");
    }
}
