//! Linux `epoll` wrapper.
//!
//! The poller is level-triggered and keyed by raw descriptor: the
//! `epoll_event` payload carries the descriptor itself, so the loop can
//! map readiness back to its handler table without a separate token slab.

use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Readiness / interest mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Ready(u32);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READ: Ready = Ready((libc::EPOLLIN | libc::EPOLLPRI) as u32);
    pub const WRITE: Ready = Ready(libc::EPOLLOUT as u32);
    pub const ERROR: Ready = Ready((libc::EPOLLERR | libc::EPOLLHUP) as u32);

    /// Raw epoll bits
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Ready(bits)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// True if every bit of `other` is set in `self`
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

/// Owner of one epoll instance and its reusable event buffer
pub(crate) struct Poller {
    epoll: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Poller {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Vec::with_capacity(256),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };

        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub(crate) fn modify(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    /// Remove a descriptor; a descriptor that is already gone is not an error
    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, Ready::EMPTY) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => Ok(()),
            other => other,
        }
    }

    /// Wait for readiness and append `(fd, mask)` pairs to `ready`.
    ///
    /// `EINTR` is returned as an `Interrupted` error so the caller decides
    /// whether to retry.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawFd, Ready)>,
    ) -> io::Result<()> {
        let timeout_ms = match timeout {
            // Round up so a sub-millisecond deadline does not turn into a busy spin
            Some(t) => {
                let ms = t.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as i32
            }
            None => -1,
        };

        self.events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        for ev in &self.events {
            let fd = ev.u64 as RawFd;
            let mask = ev.events;
            ready.push((fd, Ready::from_bits(mask)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_ready_masks() {
        let mask = Ready::READ | Ready::ERROR;
        assert!(mask.is_readable());
        assert!(mask.is_error());
        assert!(!mask.is_writable());
        assert!(mask.contains(Ready::READ));
        assert!(!mask.contains(Ready::WRITE));
        assert!(Ready::EMPTY.is_empty());
    }

    #[test]
    fn test_poll_reports_readable() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new().unwrap();
        poller.register(b.as_raw_fd(), Ready::READ).unwrap();

        let mut ready = Vec::new();
        poller.poll(Some(Duration::from_millis(10)), &mut ready).unwrap();
        assert!(ready.is_empty());

        a.write_all(b"x").unwrap();
        poller.poll(Some(Duration::from_secs(1)), &mut ready).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, b.as_raw_fd());
        assert!(ready[0].1.is_readable());
    }

    #[test]
    fn test_deregister_twice_is_tolerated() {
        let (_a, b) = UnixStream::pair().unwrap();
        let poller = Poller::new().unwrap();
        poller.register(b.as_raw_fd(), Ready::READ).unwrap();
        poller.deregister(b.as_raw_fd()).unwrap();
        poller.deregister(b.as_raw_fd()).unwrap();
    }
}
