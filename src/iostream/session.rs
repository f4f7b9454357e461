//! Transports under a stream
//!
//! A stream talks to its socket only through [`SessionOps`], so plain TCP,
//! Unix socket pairs and TLS look the same to the buffering layer. Every
//! operation is non-blocking and reports its outcome as a
//! [`Transfer`] instead of using errors for "would block" or "peer closed".

use crate::tls::CertInfo;
use crate::Result;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

/// Outcome of one non-blocking read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// This many bytes moved
    Done(usize),
    /// Nothing can move until the descriptor is ready again
    WouldBlock,
    /// The peer closed its side
    Closed,
}

/// Progress of a transport-level handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Done,
    WantRead,
    WantWrite,
}

/// What a stream needs from its transport
pub trait SessionOps {
    /// Descriptor registered with the event loop
    fn raw_fd(&self) -> RawFd;

    /// Read into `buf` without blocking
    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer>;

    /// Write from `buf` without blocking
    fn write(&mut self, buf: &[u8]) -> Result<Transfer>;

    /// True while a handshake must complete before data can flow
    fn is_handshaking(&self) -> bool {
        false
    }

    /// Advance the handshake
    fn handshake(&mut self) -> Result<Handshake> {
        Ok(Handshake::Done)
    }

    /// Peer certificate, for sessions that have one
    fn peer_certificate(&self) -> Option<CertInfo> {
        None
    }

    /// Shut the transport down
    fn close(&mut self) -> Result<()>;
}

/// Map a std I/O result onto a [`Transfer`], retrying nothing
pub(crate) fn transfer(result: io::Result<usize>, is_read: bool) -> Result<Transfer> {
    match result {
        Ok(0) if is_read => Ok(Transfer::Closed),
        Ok(n) => Ok(Transfer::Done(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
        Err(e) => Err(e.into()),
    }
}

/// True for errors that only mean the peer went away
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Put a descriptor into non-blocking mode
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pending `SO_ERROR` on a socket, if any
pub(crate) fn socket_error(fd: RawFd) -> Option<io::Error> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Some(io::Error::last_os_error());
    }
    (err != 0).then(|| io::Error::from_raw_os_error(err))
}

/// Transport with no framing of its own
///
/// Works over anything readable, writable and backed by a descriptor:
/// `TcpStream` in the server, `UnixStream` pairs in tests.
pub struct FdSessionOps<T> {
    stream: T,
}

impl<T: Read + Write + AsRawFd> FdSessionOps<T> {
    /// Create a new FD session over a stream
    pub fn new(stream: T) -> Self {
        FdSessionOps { stream }
    }

    /// Wrapped stream
    pub fn get_ref(&self) -> &T {
        &self.stream
    }
}

impl<T: Read + Write + AsRawFd> SessionOps for FdSessionOps<T> {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        loop {
            match self.stream.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return transfer(other, !buf.is_empty()),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<Transfer> {
        loop {
            match self.stream.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return transfer(other, false),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        let rc = unsafe { libc::shutdown(self.stream.as_raw_fd(), libc::SHUT_RDWR) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Already disconnected, or not a socket
            if !matches!(err.raw_os_error(), Some(libc::ENOTCONN) | Some(libc::ENOTSOCK)) {
                return Err(err.into());
            }
        }
        Ok(())
    }
}
