//! Non-blocking buffered byte stream
//!
//! [`IoStream`] wraps a [`SessionOps`] transport (plain socket or TLS) and
//! exposes callback-based reads and queued writes on top of the
//! [`EventLoop`](crate::ioloop::EventLoop).
//!
//! # Architecture
//!
//! - Inbound bytes land in a chunked [`buffer::ReadBuffer`]; at most one
//!   read operation (byte count, delimiter, regex or "until close") is
//!   pending at a time and is satisfied from that buffer.
//! - Outbound bytes queue in a [`buffer::WriteBuffer`] and are flushed
//!   eagerly on `write` and then on every `WRITE` readiness.
//! - The epoll interest mask always equals `ERROR`, plus `READ` when a read
//!   is pending or no write is queued, plus `WRITE` when bytes are queued.
//!   While a TLS handshake runs the mask is `ERROR` plus whatever the
//!   handshake asked for.
//! - User callbacks never run re-entrantly: they are queued with
//!   `add_callback`, and the close callback waits until every queued stream
//!   callback has run.

mod buffer;
pub mod session;

pub use session::{FdSessionOps, Handshake, SessionOps, Transfer};

use crate::ioloop::{panic_message, EventLoop, Ready};
use crate::tls::CertInfo;
use crate::{Error, Result};
use buffer::{ReadBuffer, WriteBuffer};
use session::{is_disconnect, set_nonblocking, socket_error};

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

/// Default cap on buffered inbound bytes
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 104_857_600;

/// Default size of a single `read` call
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Buffering limits for one stream
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Buffered inbound bytes beyond this close the stream
    pub max_buffer_size: usize,
    /// Bytes requested from the transport per read call
    pub read_chunk_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

type ReadCallback = Box<dyn FnOnce(Result<Bytes>)>;
type WriteCallback = Box<dyn FnOnce()>;
type CloseCallback = Box<dyn FnOnce()>;

enum ReadOp {
    Bytes(usize),
    Until {
        delimiter: Vec<u8>,
        max_bytes: Option<usize>,
    },
    Regex {
        pattern: Regex,
        max_bytes: Option<usize>,
    },
    UntilClose,
}

struct PendingRead {
    op: ReadOp,
    callback: ReadCallback,
}

enum Fill {
    Data,
    WouldBlock,
    Eof,
}

struct StreamInner {
    io_loop: EventLoop,
    fd: RawFd,
    session: RefCell<Option<Box<dyn SessionOps>>>,
    options: StreamOptions,
    read_buffer: RefCell<ReadBuffer>,
    write_buffer: RefCell<WriteBuffer>,
    pending_read: RefCell<Option<PendingRead>>,
    write_callback: RefCell<Option<WriteCallback>>,
    close_callback: RefCell<Option<CloseCallback>>,
    handshake_wants: Cell<Ready>,
    registered: Cell<Option<Ready>>,
    pending_callbacks: Cell<usize>,
    closed: Cell<bool>,
    error: RefCell<Option<Rc<Error>>>,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if !self.closed.get() {
            self.io_loop.remove_handler(self.fd);
        }
    }
}

/// Buffered non-blocking stream; clones share the same stream
#[derive(Clone)]
pub struct IoStream {
    inner: Rc<StreamInner>,
}

impl IoStream {
    /// Wrap `session` and register its descriptor with `io_loop`
    pub fn new(
        io_loop: &EventLoop,
        session: Box<dyn SessionOps>,
        options: StreamOptions,
    ) -> Result<Self> {
        let fd = session.raw_fd();
        set_nonblocking(fd)?;

        let stream = IoStream {
            inner: Rc::new(StreamInner {
                io_loop: io_loop.clone(),
                fd,
                session: RefCell::new(Some(session)),
                options,
                read_buffer: RefCell::new(ReadBuffer::new()),
                write_buffer: RefCell::new(WriteBuffer::new()),
                pending_read: RefCell::new(None),
                write_callback: RefCell::new(None),
                close_callback: RefCell::new(None),
                handshake_wants: Cell::new(Ready::READ),
                registered: Cell::new(None),
                pending_callbacks: Cell::new(0),
                closed: Cell::new(false),
                error: RefCell::new(None),
            }),
        };

        let weak: Weak<StreamInner> = Rc::downgrade(&stream.inner);
        let interest = stream.interest();
        io_loop.add_handler(
            fd,
            move |_, events| {
                if let Some(inner) = weak.upgrade() {
                    IoStream { inner }.handle_events(events);
                }
            },
            interest,
        )?;
        stream.inner.registered.set(Some(interest));
        Ok(stream)
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// Loop the stream is registered with
    pub fn io_loop(&self) -> &EventLoop {
        &self.inner.io_loop
    }

    /// Read exactly `n` bytes
    pub fn read_bytes<F>(&self, n: usize, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Bytes>) + 'static,
    {
        self.start_read(ReadOp::Bytes(n), Box::new(callback))
    }

    /// Read up to and including `delimiter`
    pub fn read_until<F>(&self, delimiter: &[u8], callback: F) -> Result<()>
    where
        F: FnOnce(Result<Bytes>) + 'static,
    {
        let op = ReadOp::Until {
            delimiter: delimiter.to_vec(),
            max_bytes: None,
        };
        self.start_read(op, Box::new(callback))
    }

    /// Like [`read_until`](Self::read_until), but the callback receives
    /// [`Error::LimitExceeded`] once `max_bytes` are buffered without a match
    pub fn read_until_max<F>(&self, delimiter: &[u8], max_bytes: usize, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Bytes>) + 'static,
    {
        let op = ReadOp::Until {
            delimiter: delimiter.to_vec(),
            max_bytes: Some(max_bytes),
        };
        self.start_read(op, Box::new(callback))
    }

    /// Read up to the end of the first match of `pattern`
    pub fn read_until_regex<F>(&self, pattern: &Regex, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Bytes>) + 'static,
    {
        let op = ReadOp::Regex {
            pattern: pattern.clone(),
            max_bytes: None,
        };
        self.start_read(op, Box::new(callback))
    }

    /// Collect everything until the stream closes
    pub fn read_until_close<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Bytes>) + 'static,
    {
        self.start_read(ReadOp::UntilClose, Box::new(callback))
    }

    fn start_read(&self, op: ReadOp, callback: ReadCallback) -> Result<()> {
        if self.closed() {
            return Err(Error::StreamClosed);
        }
        {
            let mut pending = self.inner.pending_read.borrow_mut();
            if pending.is_some() {
                return Err(Error::ReadPending);
            }
            *pending = Some(PendingRead { op, callback });
        }
        self.try_satisfy_read();
        self.sync_interest();
        Ok(())
    }

    /// Queue `data` and flush as much as the transport accepts
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.queue_write(data.into(), None)
    }

    /// Queue `data`; `callback` runs once the whole queue has been sent.
    ///
    /// A newer callback replaces one that has not fired yet.
    pub fn write_with<F>(&self, data: impl Into<Bytes>, callback: F) -> Result<()>
    where
        F: FnOnce() + 'static,
    {
        self.queue_write(data.into(), Some(Box::new(callback)))
    }

    fn queue_write(&self, data: Bytes, callback: Option<WriteCallback>) -> Result<()> {
        if self.closed() {
            return Err(Error::StreamClosed);
        }
        self.inner.write_buffer.borrow_mut().push(data);
        if let Some(callback) = callback {
            let replaced = self.inner.write_callback.borrow_mut().replace(callback);
            drop(replaced);
        }
        if !self.is_handshaking() {
            self.handle_write();
        }
        self.sync_interest();
        Ok(())
    }

    /// Run `callback` once the stream has closed and its queued callbacks ran
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        let replaced = self
            .inner
            .close_callback
            .borrow_mut()
            .replace(Box::new(callback));
        drop(replaced);
        self.maybe_run_close_callback();
    }

    /// Close the stream; later calls do nothing
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        tracing::trace!(fd = self.inner.fd, "closing stream");

        let pending = self.inner.pending_read.borrow_mut().take();
        if let Some(PendingRead {
            op: ReadOp::UntilClose,
            callback,
        }) = pending
        {
            let data = self.inner.read_buffer.borrow_mut().take_all();
            self.run_callback(move || callback(Ok(data)));
        }

        self.inner.io_loop.remove_handler(self.inner.fd);
        self.inner.registered.set(None);

        let session = self.inner.session.borrow_mut().take();
        if let Some(mut session) = session {
            if let Err(e) = session.close() {
                tracing::debug!(fd = self.inner.fd, error = %e, "error shutting down transport");
            }
        }

        self.inner.read_buffer.borrow_mut().clear();
        self.inner.write_buffer.borrow_mut().clear();
        let write_callback = self.inner.write_callback.borrow_mut().take();
        drop(write_callback);

        self.maybe_run_close_callback();
    }

    pub fn reading(&self) -> bool {
        self.inner.pending_read.borrow().is_some()
    }

    pub fn writing(&self) -> bool {
        !self.inner.write_buffer.borrow().is_empty()
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Error that closed the stream, if one did
    pub fn error(&self) -> Option<Rc<Error>> {
        self.inner.error.borrow().clone()
    }

    /// Certificate presented by the peer (TLS only)
    pub fn peer_certificate(&self) -> Option<CertInfo> {
        self.inner
            .session
            .borrow()
            .as_ref()
            .and_then(|session| session.peer_certificate())
    }

    /// Interest mask currently registered with the loop
    pub(crate) fn registered_interest(&self) -> Option<Ready> {
        self.inner.registered.get()
    }

    fn is_handshaking(&self) -> bool {
        self.inner
            .session
            .borrow()
            .as_ref()
            .is_some_and(|session| session.is_handshaking())
    }

    fn interest(&self) -> Ready {
        if self.closed() {
            return Ready::EMPTY;
        }
        if self.is_handshaking() {
            return Ready::ERROR | self.inner.handshake_wants.get();
        }
        let mut interest = Ready::ERROR;
        if self.reading() || !self.writing() {
            interest |= Ready::READ;
        }
        if self.writing() {
            interest |= Ready::WRITE;
        }
        interest
    }

    fn sync_interest(&self) {
        if self.closed() {
            return;
        }
        let wanted = self.interest();
        if self.inner.registered.get() == Some(wanted) {
            return;
        }
        match self.inner.io_loop.update_handler(self.inner.fd, wanted) {
            Ok(()) => self.inner.registered.set(Some(wanted)),
            Err(e) => {
                tracing::warn!(fd = self.inner.fd, error = %e, "failed to update interest");
                self.close_with_error(e);
            }
        }
    }

    fn handle_events(&self, events: Ready) {
        if self.closed() {
            return;
        }

        if self.is_handshaking() {
            self.do_handshake();
            if events.is_error() && self.is_handshaking() {
                self.close_with_error(self.pending_socket_error());
                return;
            }
        } else {
            if events.is_readable() {
                self.handle_read();
            }
            if self.closed() {
                return;
            }
            if events.is_writable() {
                self.handle_write();
            }
            if self.closed() {
                return;
            }
            if events.is_error() {
                let err = self.pending_socket_error();
                tracing::debug!(fd = self.inner.fd, error = %err, "error event on stream");
                self.close_with_error(err);
                return;
            }
        }
        self.sync_interest();
    }

    fn pending_socket_error(&self) -> Error {
        match socket_error(self.inner.fd) {
            Some(err) => err.into(),
            None => Error::StreamClosed,
        }
    }

    fn do_handshake(&self) {
        let result = {
            let mut session = self.inner.session.borrow_mut();
            match session.as_mut() {
                Some(session) => session.handshake(),
                None => return,
            }
        };

        match result {
            Ok(Handshake::Done) => {
                tracing::debug!(fd = self.inner.fd, "handshake complete");
                self.inner.handshake_wants.set(Ready::READ);
                // Application data may already sit in the transport
                self.handle_read();
                if !self.closed() {
                    self.handle_write();
                }
            }
            Ok(Handshake::WantRead) => self.inner.handshake_wants.set(Ready::READ),
            Ok(Handshake::WantWrite) => self.inner.handshake_wants.set(Ready::WRITE),
            Err(e) => {
                tracing::debug!(fd = self.inner.fd, error = %e, "handshake failed");
                self.close_with_error(e);
            }
        }
    }

    fn read_to_buffer(&self) -> Result<Fill> {
        let mut chunk = BytesMut::zeroed(self.inner.options.read_chunk_size);
        let outcome = {
            let mut session = self.inner.session.borrow_mut();
            match session.as_mut() {
                Some(session) => session.read(&mut chunk)?,
                None => return Ok(Fill::Eof),
            }
        };

        match outcome {
            Transfer::Done(n) => {
                chunk.truncate(n);
                self.inner.read_buffer.borrow_mut().push(chunk.freeze());
                Ok(Fill::Data)
            }
            Transfer::WouldBlock => Ok(Fill::WouldBlock),
            Transfer::Closed => Ok(Fill::Eof),
        }
    }

    fn handle_read(&self) {
        loop {
            match self.read_to_buffer() {
                Ok(Fill::Data) => {
                    let buffered = self.inner.read_buffer.borrow().len();
                    let max = self.inner.options.max_buffer_size;
                    if buffered > max {
                        tracing::error!(
                            fd = self.inner.fd,
                            buffered,
                            max,
                            "reached maximum read buffer size"
                        );
                        self.close_with_error(Error::BufferFull(max));
                        return;
                    }
                }
                Ok(Fill::WouldBlock) => break,
                Ok(Fill::Eof) => {
                    self.try_satisfy_read();
                    self.close();
                    return;
                }
                Err(e) => {
                    match &e {
                        Error::Io(io) if is_disconnect(io) => {
                            tracing::debug!(fd = self.inner.fd, error = %e, "peer disconnected")
                        }
                        _ => tracing::warn!(fd = self.inner.fd, error = %e, "read error on stream"),
                    }
                    self.close_with_error(e);
                    return;
                }
            }
        }
        self.try_satisfy_read();
    }

    fn try_satisfy_read(&self) {
        let outcome = {
            let pending = self.inner.pending_read.borrow();
            let Some(pending) = pending.as_ref() else {
                return;
            };
            let mut buffer = self.inner.read_buffer.borrow_mut();
            match &pending.op {
                ReadOp::Bytes(n) => (buffer.len() >= *n).then(|| Ok(buffer.consume(*n))),
                ReadOp::Until {
                    delimiter,
                    max_bytes,
                } => {
                    let found = buffer.find_delimiter(delimiter);
                    settle(&mut buffer, found, *max_bytes)
                }
                ReadOp::Regex { pattern, max_bytes } => {
                    let found = buffer.find_regex(pattern);
                    settle(&mut buffer, found, *max_bytes)
                }
                ReadOp::UntilClose => None,
            }
        };

        let Some(result) = outcome else {
            return;
        };
        let pending = self.inner.pending_read.borrow_mut().take();
        if let Some(PendingRead { callback, .. }) = pending {
            self.run_callback(move || callback(result));
        }
    }

    fn handle_write(&self) {
        loop {
            let front = self.inner.write_buffer.borrow_mut().front();
            let Some(front) = front else {
                break;
            };

            let outcome = {
                let mut session = self.inner.session.borrow_mut();
                match session.as_mut() {
                    Some(session) => session.write(&front),
                    None => return,
                }
            };

            match outcome {
                Ok(Transfer::Done(0)) | Ok(Transfer::WouldBlock) => {
                    self.inner.write_buffer.borrow_mut().freeze();
                    break;
                }
                Ok(Transfer::Done(n)) => self.inner.write_buffer.borrow_mut().advance(n),
                Ok(Transfer::Closed) => {
                    self.close();
                    return;
                }
                Err(e) => {
                    match &e {
                        Error::Io(io) if is_disconnect(io) => {
                            tracing::debug!(fd = self.inner.fd, error = %e, "peer disconnected")
                        }
                        _ => tracing::warn!(fd = self.inner.fd, error = %e, "write error"),
                    }
                    self.close_with_error(e);
                    return;
                }
            }
        }

        if self.inner.write_buffer.borrow().is_empty() {
            let callback = self.inner.write_callback.borrow_mut().take();
            if let Some(callback) = callback {
                self.run_callback(callback);
            }
        }
    }

    fn close_with_error(&self, error: impl Into<Error>) {
        if !self.closed() {
            *self.inner.error.borrow_mut() = Some(Rc::new(error.into()));
        }
        self.close();
    }

    /// Queue `callback` on the loop, closing the stream if it panics
    fn run_callback<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        let count = &self.inner.pending_callbacks;
        count.set(count.get() + 1);

        let stream = self.clone();
        self.inner.io_loop.add_callback(move || {
            let outcome = catch_unwind(AssertUnwindSafe(callback));
            let count = &stream.inner.pending_callbacks;
            count.set(count.get() - 1);

            if let Err(panic) = outcome {
                tracing::error!(
                    fd = stream.inner.fd,
                    message = panic_message(&panic),
                    "uncaught panic in stream callback, closing"
                );
                stream.close();
            }

            if stream.closed() {
                stream.maybe_run_close_callback();
            } else {
                stream.sync_interest();
            }
        });
    }

    fn maybe_run_close_callback(&self) {
        if !self.closed() || self.inner.pending_callbacks.get() > 0 {
            return;
        }
        let callback = self.inner.close_callback.borrow_mut().take();
        if let Some(callback) = callback {
            self.run_callback(callback);
        }
    }
}

/// Turn a search result into a read outcome, honouring `max_bytes`
fn settle(
    buffer: &mut ReadBuffer,
    found: Option<usize>,
    max_bytes: Option<usize>,
) -> Option<Result<Bytes>> {
    match (found, max_bytes) {
        (Some(end), Some(max)) if end > max => Some(Err(Error::LimitExceeded(max))),
        (Some(end), _) => Some(Ok(buffer.consume(end))),
        (None, Some(max)) if buffer.len() >= max => Some(Err(Error::LimitExceeded(max))),
        (None, _) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    fn stream_pair(io_loop: &EventLoop, options: StreamOptions) -> (UnixStream, IoStream) {
        let (peer, ours) = UnixStream::pair().unwrap();
        let stream = IoStream::new(io_loop, Box::new(FdSessionOps::new(ours)), options).unwrap();
        (peer, stream)
    }

    /// Stop the loop after a while so a broken test fails instead of hanging
    fn watchdog(io_loop: &EventLoop) {
        let stopper = io_loop.clone();
        io_loop.add_timeout(Duration::from_secs(5), move || stopper.stop());
    }

    type Slot = Rc<RefCell<Option<Result<Bytes>>>>;

    fn capture(io_loop: &EventLoop, slot: &Slot) -> impl FnOnce(Result<Bytes>) + 'static {
        let (l, s) = (io_loop.clone(), Rc::clone(slot));
        move |result| {
            *s.borrow_mut() = Some(result);
            l.stop();
        }
    }

    #[test]
    fn test_read_bytes_across_fragments() {
        let io_loop = EventLoop::new().unwrap();
        let (mut peer, stream) = stream_pair(&io_loop, StreamOptions::default());
        let got: Slot = Rc::new(RefCell::new(None));

        let writer = thread::spawn(move || {
            for part in [&b"abc"[..], b"defg", b"h", b"ijklmnop"] {
                peer.write_all(part).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
            peer
        });

        stream.read_bytes(16, capture(&io_loop, &got)).unwrap();
        watchdog(&io_loop);
        io_loop.start().unwrap();
        let _peer = writer.join().unwrap();

        let data = got.borrow_mut().take().unwrap().unwrap();
        assert_eq!(&data[..], b"abcdefghijklmnop");
    }

    #[test]
    fn test_read_until_leaves_remainder_buffered() {
        let io_loop = EventLoop::new().unwrap();
        let (mut peer, stream) = stream_pair(&io_loop, StreamOptions::default());
        let head = Rc::new(RefCell::new(None));
        let rest: Slot = Rc::new(RefCell::new(None));

        let writer = thread::spawn(move || {
            for part in [&b"He"[..], b"llo\r\n", b"\r\nMore"] {
                peer.write_all(part).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
            peer
        });

        let (s, h, next) = (stream.clone(), Rc::clone(&head), capture(&io_loop, &rest));
        stream
            .read_until(b"\r\n\r\n", move |result| {
                *h.borrow_mut() = Some(result.unwrap());
                s.read_bytes(4, next).unwrap();
            })
            .unwrap();

        watchdog(&io_loop);
        io_loop.start().unwrap();
        let _peer = writer.join().unwrap();

        assert_eq!(&head.borrow().as_ref().unwrap()[..], b"Hello\r\n\r\n");
        assert_eq!(&rest.borrow_mut().take().unwrap().unwrap()[..], b"More");
    }

    #[test]
    fn test_second_read_is_rejected() {
        let io_loop = EventLoop::new().unwrap();
        let (_peer, stream) = stream_pair(&io_loop, StreamOptions::default());

        stream.read_until(b"\n", |_| {}).unwrap();
        assert!(stream.reading());
        let err = stream.read_bytes(1, |_| {}).unwrap_err();
        assert!(matches!(err, Error::ReadPending));
    }

    #[test]
    fn test_read_until_max_reports_limit() {
        let io_loop = EventLoop::new().unwrap();
        let (mut peer, stream) = stream_pair(&io_loop, StreamOptions::default());
        let got: Slot = Rc::new(RefCell::new(None));

        peer.write_all(&[b'x'; 100]).unwrap();
        stream.read_until_max(b"\n", 10, capture(&io_loop, &got)).unwrap();
        watchdog(&io_loop);
        io_loop.start().unwrap();

        let result = got.borrow_mut().take().unwrap();
        assert!(matches!(result, Err(Error::LimitExceeded(10))));
        assert!(!stream.closed());
    }

    #[test]
    fn test_read_until_regex() {
        let io_loop = EventLoop::new().unwrap();
        let (mut peer, stream) = stream_pair(&io_loop, StreamOptions::default());
        let got: Slot = Rc::new(RefCell::new(None));
        let pattern = Regex::new(r"[0-9]+;").unwrap();

        peer.write_all(b"size=1234;tail").unwrap();
        stream.read_until_regex(&pattern, capture(&io_loop, &got)).unwrap();
        watchdog(&io_loop);
        io_loop.start().unwrap();

        assert_eq!(&got.borrow_mut().take().unwrap().unwrap()[..], b"size=1234;");
    }

    #[test]
    fn test_large_write_runs_callback_when_flushed() {
        const TOTAL: usize = 4 * 1024 * 1024;
        let io_loop = EventLoop::new().unwrap();
        let (mut peer, stream) = stream_pair(&io_loop, StreamOptions::default());
        let flushed = Rc::new(Cell::new(false));

        let reader = thread::spawn(move || {
            let mut data = vec![0u8; TOTAL];
            peer.read_exact(&mut data).unwrap();
            data
        });

        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        let (l, f) = (io_loop.clone(), Rc::clone(&flushed));
        stream
            .write_with(payload.clone(), move || {
                f.set(true);
                l.stop();
            })
            .unwrap();
        assert!(stream.writing());

        watchdog(&io_loop);
        io_loop.start().unwrap();

        assert!(flushed.get());
        assert!(!stream.writing());
        assert_eq!(reader.join().unwrap(), payload);
    }

    #[test]
    fn test_interest_tracks_pending_work() {
        let io_loop = EventLoop::new().unwrap();
        let (_peer, stream) = stream_pair(&io_loop, StreamOptions::default());
        assert_eq!(stream.registered_interest(), Some(Ready::ERROR | Ready::READ));

        // Nobody reads the peer, so the send buffer fills up
        stream.write(vec![0u8; 8 * 1024 * 1024]).unwrap();
        assert!(stream.writing());
        assert_eq!(stream.registered_interest(), Some(Ready::ERROR | Ready::WRITE));

        stream.read_bytes(1, |_| {}).unwrap();
        assert_eq!(
            stream.registered_interest(),
            Some(Ready::ERROR | Ready::READ | Ready::WRITE)
        );

        stream.close();
        assert_eq!(stream.registered_interest(), None);
        assert_eq!(io_loop.handler_count(), 0);
    }

    #[test]
    fn test_close_callback_on_peer_eof() {
        let io_loop = EventLoop::new().unwrap();
        let (peer, stream) = stream_pair(&io_loop, StreamOptions::default());
        let closed = Rc::new(Cell::new(false));

        let (l, c) = (io_loop.clone(), Rc::clone(&closed));
        stream.set_close_callback(move || {
            c.set(true);
            l.stop();
        });
        drop(peer);

        watchdog(&io_loop);
        io_loop.start().unwrap();
        assert!(closed.get());
        assert!(stream.closed());
        assert!(stream.error().is_none());
    }

    #[test]
    fn test_read_until_close_delivers_everything() {
        let io_loop = EventLoop::new().unwrap();
        let (mut peer, stream) = stream_pair(&io_loop, StreamOptions::default());
        let got: Slot = Rc::new(RefCell::new(None));
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        stream.set_close_callback(move || o.borrow_mut().push("close"));
        let (o, inner) = (Rc::clone(&order), capture(&io_loop, &got));
        stream
            .read_until_close(move |result| {
                o.borrow_mut().push("read");
                inner(result);
            })
            .unwrap();

        peer.write_all(b"all of it").unwrap();
        drop(peer);

        watchdog(&io_loop);
        io_loop.start().unwrap();

        assert_eq!(&got.borrow_mut().take().unwrap().unwrap()[..], b"all of it");
        // The close callback is queued behind the read callback
        let stopper = io_loop.clone();
        io_loop.add_callback(move || stopper.stop());
        io_loop.start().unwrap();
        assert_eq!(*order.borrow(), vec!["read", "close"]);
    }

    #[test]
    fn test_oversized_buffer_closes_stream() {
        let io_loop = EventLoop::new().unwrap();
        let options = StreamOptions {
            max_buffer_size: 16,
            read_chunk_size: 8,
        };
        let (mut peer, stream) = stream_pair(&io_loop, options);

        let l = io_loop.clone();
        stream.set_close_callback(move || l.stop());
        stream.read_until(b"\n", |_| panic!("no delimiter was sent")).unwrap();
        peer.write_all(&[b'a'; 64]).unwrap();

        watchdog(&io_loop);
        io_loop.start().unwrap();

        assert!(stream.closed());
        let err = stream.error().unwrap();
        assert!(matches!(*err, Error::BufferFull(16)));
    }

    #[test]
    fn test_operations_on_closed_stream() {
        let io_loop = EventLoop::new().unwrap();
        let (_peer, stream) = stream_pair(&io_loop, StreamOptions::default());
        stream.close();
        stream.close();

        assert!(matches!(stream.write(&b"x"[..]), Err(Error::StreamClosed)));
        assert!(matches!(stream.read_bytes(1, |_| {}), Err(Error::StreamClosed)));
    }

    #[test]
    fn test_panicking_read_callback_closes_stream() {
        let io_loop = EventLoop::new().unwrap();
        let (mut peer, stream) = stream_pair(&io_loop, StreamOptions::default());

        let l = io_loop.clone();
        stream.set_close_callback(move || l.stop());
        stream.read_bytes(2, |_| panic!("handler bug")).unwrap();
        peer.write_all(b"hi").unwrap();

        watchdog(&io_loop);
        io_loop.start().unwrap();
        assert!(stream.closed());
    }
}
