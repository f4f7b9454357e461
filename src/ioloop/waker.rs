//! Self-pipe used to interrupt a blocked `epoll_wait`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Non-blocking pipe pair; writing one byte makes the read end readable.
///
/// Concurrent `wake` calls from several threads are fine: each is a single
/// `write(2)` of one byte on a pipe.
pub struct Waker {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Waker {
            reader: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            writer: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }

    /// Descriptor the loop watches for READ
    pub fn reader_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Make the read end readable.
    ///
    /// A full pipe (`EAGAIN`) already guarantees a pending wake-up.
    pub fn wake(&self) {
        let byte = [b'x'];
        let rc = unsafe { libc::write(self.writer.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::debug!(error = %err, "waker write failed");
            }
        }
    }

    /// Consume every pending wake-up byte
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let fd = self.reader.as_raw_fd();
            let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }
}
