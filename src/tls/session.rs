//! Non-blocking OpenSSL transport for [`IoStream`](crate::iostream::IoStream)
//!
//! The handshake is driven step by step from the stream's readiness callbacks
//! instead of blocking in `accept`.

use super::cert::CertInfo;
use super::config::{TlsConfig, TlsError};
use crate::iostream::{Handshake, SessionOps, Transfer};
use crate::Result;
use openssl::ssl::{ErrorCode, Ssl, SslStream};
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

/// TLS session operations over a non-blocking TCP socket
pub struct TlsSession {
    stream: SslStream<TcpStream>,
    handshaking: bool,
    failed: bool,
}

impl TlsSession {
    /// Prepare the server side of a session; no bytes move until
    /// [`SessionOps::handshake`] is called
    pub fn accept(
        tcp_stream: TcpStream,
        config: &TlsConfig,
    ) -> std::result::Result<Self, TlsError> {
        tcp_stream.set_nonblocking(true)?;
        let ssl = Ssl::new(&config.ctx)?;
        let stream = SslStream::new(ssl, tcp_stream)?;

        Ok(TlsSession {
            stream,
            handshaking: true,
            failed: false,
        })
    }

    /// A fatal TLS error has occurred
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Socket under the TLS layer
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    /// Map an OpenSSL error from `ssl_read`/`ssl_write` onto a transfer outcome
    fn transfer_error(&mut self, err: openssl::ssl::Error) -> Result<Transfer> {
        let code = err.code();
        if code == ErrorCode::WANT_READ || code == ErrorCode::WANT_WRITE {
            return Ok(Transfer::WouldBlock);
        }
        if code == ErrorCode::ZERO_RETURN {
            return Ok(Transfer::Closed);
        }

        self.failed = true;
        match err.into_io_error() {
            Ok(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.failed = false;
                Ok(Transfer::WouldBlock)
            }
            Ok(e) => Err(e.into()),
            // SYSCALL without an errno is an EOF that skipped close_notify
            Err(_) if code == ErrorCode::SYSCALL => Ok(Transfer::Closed),
            Err(e) => Err(TlsError::OperationFailed(e.to_string()).into()),
        }
    }
}

impl SessionOps for TlsSession {
    fn raw_fd(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        match self.stream.ssl_read(buf) {
            Ok(0) if !buf.is_empty() => Ok(Transfer::Closed),
            Ok(n) => Ok(Transfer::Done(n)),
            Err(e) => self.transfer_error(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<Transfer> {
        match self.stream.ssl_write(buf) {
            Ok(n) => Ok(Transfer::Done(n)),
            Err(e) => self.transfer_error(e),
        }
    }

    fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    fn handshake(&mut self) -> Result<Handshake> {
        if !self.handshaking {
            return Ok(Handshake::Done);
        }
        match self.stream.accept() {
            Ok(()) => {
                self.handshaking = false;
                tracing::trace!(
                    version = self.stream.ssl().version_str(),
                    cipher = self.stream.ssl().current_cipher().map(|c| c.name()),
                    "TLS session established"
                );
                Ok(Handshake::Done)
            }
            Err(e) if e.code() == ErrorCode::WANT_READ => Ok(Handshake::WantRead),
            Err(e) if e.code() == ErrorCode::WANT_WRITE => Ok(Handshake::WantWrite),
            Err(e) => {
                self.failed = true;
                Err(TlsError::HandshakeFailed(e.to_string()).into())
            }
        }
    }

    fn peer_certificate(&self) -> Option<CertInfo> {
        self.stream
            .ssl()
            .peer_certificate()
            .map(|cert| CertInfo::from_x509(&cert))
    }

    fn close(&mut self) -> Result<()> {
        // Best effort close_notify; the socket is non-blocking
        if !self.failed && !self.handshaking {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}
