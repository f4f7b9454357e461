//! HTTP/1.1 connection state machine
//!
//! An [`HttpConnection`] owns one [`IoStream`] and serves requests on it one
//! at a time. Each request is read as a header block, then either a
//! `Content-Length` body, a sequence of chunks, or nothing, and every
//! complete unit is handed to the [`RequestHandler`]. The application
//! answers through [`HttpConnection::write`] and signals the end of its
//! response with [`HttpConnection::finish`]; the connection then either
//! waits for the next request or closes.

use super::chunked::parse_chunk_line;
use super::message::error_response;
use super::parser::{parse_request_head, ResponseHeadParser};
use super::{Chunk, Error, Headers, Method, RequestHead, RequestUnit, Result, Status, Version};
use crate::config::ServerConfig;
use crate::ioloop::{panic_message, run_guarded, Timeout};
use crate::iostream::IoStream;
use crate::tls::CertInfo;

use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const LINE_TERMINATOR: &[u8] = b"\r\n";
const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Application entry point for parsed requests
///
/// Called once per complete unit: the whole request when it is not chunked,
/// otherwise once per chunk and once more for the last chunk or trailers.
/// Implementations must not block.
pub trait RequestHandler {
    fn handle_request(&self, conn: &HttpConnection, head: &RequestHead, unit: RequestUnit);
}

/// Per-connection limits and keep-alive policy
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Close after every response
    pub no_keep_alive: bool,
    /// Largest accepted `Content-Length` or chunk size
    pub max_body_size: usize,
    /// Largest header block, chunk-size line or trailer block
    pub max_header_size: usize,
    /// Piece size used when discarding an oversized body
    pub read_chunk_size: usize,
    /// Close after this long without a request; `None` waits forever
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ConnectionOptions {
    fn from(config: &ServerConfig) -> Self {
        ConnectionOptions {
            no_keep_alive: config.no_keep_alive,
            max_body_size: config.max_buffer_size,
            max_header_size: config.max_header_size,
            read_chunk_size: config.read_chunk_size,
            idle_timeout: (config.connection_timeout > 0.0)
                .then(|| Duration::from_secs_f64(config.connection_timeout)),
        }
    }
}

/// Where a connection is in its request cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for a start line and headers
    AwaitStart,
    /// Reading a `Content-Length` body
    AwaitBody,
    /// Reading a chunk-size line
    AwaitChunkLine,
    /// Reading chunk data and its CRLF
    AwaitChunkData,
    /// Reading trailer lines after the zero-size chunk
    AwaitTrailers,
    /// Dropping the body of a request that was answered with 413
    Discarding,
    /// Request fully read; waiting for the response to finish
    AwaitFinish,
    Closed,
}

type Callback = Box<dyn FnOnce()>;

struct ConnInner {
    stream: IoStream,
    peer: Option<SocketAddr>,
    handler: Rc<dyn RequestHandler>,
    options: ConnectionOptions,
    state: Cell<ConnState>,
    request: RefCell<Option<Rc<RequestHead>>>,
    /// Every unit of the current request has been read
    request_done: Cell<bool>,
    /// The application called `finish`
    finished: Cell<bool>,
    wrote_anything: Cell<bool>,
    /// Close once queued bytes are flushed
    close_pending: Cell<bool>,
    response: RefCell<ResponseHeadParser>,
    idle_timer: RefCell<Option<Timeout>>,
    write_callback: RefCell<Option<Callback>>,
    close_callback: RefCell<Option<Callback>>,
    finish_callback: RefCell<Option<Callback>>,
    release_hook: RefCell<Option<Callback>>,
}

/// One client connection; clones share the same connection
#[derive(Clone)]
pub struct HttpConnection {
    inner: Rc<ConnInner>,
}

impl HttpConnection {
    /// Take over `stream` and start reading the first request
    pub fn new(
        stream: IoStream,
        peer: Option<SocketAddr>,
        handler: Rc<dyn RequestHandler>,
        options: ConnectionOptions,
    ) -> Self {
        let max_header_size = options.max_header_size;
        let conn = HttpConnection {
            inner: Rc::new(ConnInner {
                stream,
                peer,
                handler,
                options,
                state: Cell::new(ConnState::AwaitStart),
                request: RefCell::new(None),
                request_done: Cell::new(false),
                finished: Cell::new(false),
                wrote_anything: Cell::new(false),
                close_pending: Cell::new(false),
                response: RefCell::new(ResponseHeadParser::new(max_header_size)),
                idle_timer: RefCell::new(None),
                write_callback: RefCell::new(None),
                close_callback: RefCell::new(None),
                finish_callback: RefCell::new(None),
                release_hook: RefCell::new(None),
            }),
        };

        let closing = conn.clone();
        conn.inner
            .stream
            .set_close_callback(move || closing.on_stream_closed());
        conn.await_request();
        conn
    }

    /// Queue response bytes
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.note_written(&data);

        let conn = self.clone();
        self.inner
            .stream
            .write_with(data, move || conn.on_write_complete())
    }

    /// Queue response bytes; `callback` runs once everything queued so far
    /// has been sent. A newer callback replaces one that has not fired.
    pub fn write_with<F>(&self, data: impl Into<Bytes>, callback: F) -> Result<()>
    where
        F: FnOnce() + 'static,
    {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        let replaced = self
            .inner
            .write_callback
            .borrow_mut()
            .replace(Box::new(callback));
        drop(replaced);
        self.write(data)
    }

    /// The response to the current request is complete
    pub fn finish(&self) -> Result<()> {
        if self.inner.request.borrow().is_none() {
            return Err(Error::NoRequest);
        }
        self.inner.finished.set(true);
        self.maybe_finish_request();
        Ok(())
    }

    /// Close the connection; later calls do nothing
    pub fn close(&self) {
        self.cancel_idle_timer();
        self.inner.stream.close();
    }

    /// Run `callback` once the connection has closed
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        if self.state() == ConnState::Closed {
            run_guarded("connection close callback", callback);
            return;
        }
        let replaced = self
            .inner
            .close_callback
            .borrow_mut()
            .replace(Box::new(callback));
        drop(replaced);
    }

    /// Run `callback` when the current request finishes, before the
    /// connection is reused or closed
    pub fn set_finish_callback<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        let replaced = self
            .inner
            .finish_callback
            .borrow_mut()
            .replace(Box::new(callback));
        drop(replaced);
    }

    /// Runs after the close callback; the server uses it to forget the
    /// connection
    pub(crate) fn set_release_hook<F>(&self, hook: F)
    where
        F: FnOnce() + 'static,
    {
        *self.inner.release_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Client certificate, for TLS connections that received one
    pub fn ssl_certificate(&self) -> Option<CertInfo> {
        self.inner.stream.peer_certificate()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stream.closed()
    }

    pub fn state(&self) -> ConnState {
        self.inner.state.get()
    }

    /// Something was written for the request in flight
    pub fn response_started(&self) -> bool {
        self.inner.wrote_anything.get()
    }

    /// Head of the request in flight
    pub fn request(&self) -> Option<Rc<RequestHead>> {
        self.inner.request.borrow().clone()
    }

    fn set_state(&self, state: ConnState) {
        if self.inner.state.get() != ConnState::Closed {
            self.inner.state.set(state);
        }
    }

    fn await_request(&self) {
        if self.is_closed() {
            return;
        }
        self.set_state(ConnState::AwaitStart);
        self.arm_idle_timer();

        let conn = self.clone();
        let result = self.inner.stream.read_until_max(
            HEAD_TERMINATOR,
            self.inner.options.max_header_size,
            move |result| conn.on_headers(result),
        );
        if let Err(e) = result {
            self.abort(e);
        }
    }

    fn arm_idle_timer(&self) {
        let Some(timeout) = self.inner.options.idle_timeout else {
            return;
        };
        self.cancel_idle_timer();

        let weak: Weak<ConnInner> = Rc::downgrade(&self.inner);
        let timer = self.inner.stream.io_loop().add_timeout(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                let conn = HttpConnection { inner };
                tracing::debug!(peer = ?conn.inner.peer, "idle timeout, closing connection");
                conn.close();
            }
        });
        *self.inner.idle_timer.borrow_mut() = Some(timer);
    }

    fn cancel_idle_timer(&self) {
        if let Some(timer) = self.inner.idle_timer.borrow_mut().take() {
            timer.cancel();
        }
    }

    fn on_headers(&self, result: Result<Bytes>) {
        self.cancel_idle_timer();

        let block = match result {
            Ok(block) => block,
            Err(Error::LimitExceeded(max)) => {
                tracing::debug!(peer = ?self.inner.peer, max, "request head too large");
                return self.reject(Status::PAYLOAD_TOO_LARGE);
            }
            Err(e) => return self.abort(e),
        };

        let head = match parse_request_head(&block) {
            Ok(head) => head,
            Err(Error::InvalidMethod(method)) => {
                tracing::debug!(peer = ?self.inner.peer, method = %method, "unsupported method");
                return self.reject(Status::NOT_IMPLEMENTED);
            }
            Err(e) => {
                tracing::debug!(peer = ?self.inner.peer, error = %e, "malformed request head");
                return self.reject(Status::BAD_REQUEST);
            }
        };
        if head.version != Version::Http11 {
            tracing::debug!(
                peer = ?self.inner.peer,
                version = %head.version,
                "unsupported HTTP version"
            );
            return self.reject(Status::BAD_REQUEST);
        }
        let content_length = match head.content_length() {
            Ok(length) => length,
            Err(e) => {
                tracing::debug!(peer = ?self.inner.peer, error = %e, "bad request framing");
                return self.reject(Status::BAD_REQUEST);
            }
        };

        tracing::trace!(
            peer = ?self.inner.peer,
            method = %head.method,
            uri = %head.uri,
            "request head"
        );

        let head = Rc::new(head);
        *self.inner.request.borrow_mut() = Some(Rc::clone(&head));
        self.inner.request_done.set(false);
        self.inner.finished.set(false);
        self.inner.wrote_anything.set(false);
        self.inner.response.borrow_mut().reset();

        if head.is_chunked() {
            if head.expects_continue() {
                self.write_continue();
            }
            return self.read_chunk_line(head);
        }

        match content_length {
            Some(length) if length > self.inner.options.max_body_size => {
                tracing::debug!(peer = ?self.inner.peer, length, "request body too large");
                if head.expects_continue() {
                    // The client holds the body back, so the stream cannot be
                    // resynchronized
                    return self.reject(Status::PAYLOAD_TOO_LARGE);
                }
                self.answer_too_large(&head, length);
            }
            Some(length) if length > 0 => {
                if head.expects_continue() {
                    self.write_continue();
                }
                self.set_state(ConnState::AwaitBody);
                let conn = self.clone();
                let result = self.inner.stream.read_bytes(length, move |result| match result {
                    Ok(body) => {
                        conn.dispatch(head, RequestUnit::Full { body: Some(body) });
                    }
                    Err(e) => conn.abort(e),
                });
                if let Err(e) = result {
                    self.abort(e);
                }
            }
            _ => {
                self.dispatch(head, RequestUnit::Full { body: None });
            }
        }
    }

    fn write_continue(&self) {
        if let Err(e) = self.inner.stream.write(Bytes::from_static(CONTINUE_LINE)) {
            tracing::debug!(peer = ?self.inner.peer, error = %e, "failed to send 100 Continue");
        }
    }

    /// Answer 413 on the application's behalf, then drop the body
    fn answer_too_large(&self, head: &RequestHead, length: usize) {
        if self.inner.options.no_keep_alive || head.wants_close() {
            return self.reject(Status::PAYLOAD_TOO_LARGE);
        }
        if let Err(e) = self.write(error_response(Status::PAYLOAD_TOO_LARGE, true)) {
            return self.abort(e);
        }
        self.inner.finished.set(true);
        self.discard_body(length);
    }

    fn discard_body(&self, remaining: usize) {
        if remaining == 0 {
            self.inner.request_done.set(true);
            self.set_state(ConnState::AwaitFinish);
            self.maybe_finish_request();
            return;
        }
        self.set_state(ConnState::Discarding);

        let piece = remaining.min(self.inner.options.read_chunk_size.max(1));
        let conn = self.clone();
        let result = self.inner.stream.read_bytes(piece, move |result| match result {
            Ok(_) => conn.discard_body(remaining - piece),
            Err(e) => conn.abort(e),
        });
        if let Err(e) = result {
            self.abort(e);
        }
    }

    fn read_chunk_line(&self, head: Rc<RequestHead>) {
        if self.is_closed() {
            return;
        }
        self.set_state(ConnState::AwaitChunkLine);

        let conn = self.clone();
        let result = self.inner.stream.read_until_max(
            LINE_TERMINATOR,
            self.inner.options.max_header_size,
            move |result| conn.on_chunk_line(head, result),
        );
        if let Err(e) = result {
            self.abort(e);
        }
    }

    fn on_chunk_line(&self, head: Rc<RequestHead>, result: Result<Bytes>) {
        let line = match result {
            Ok(line) => line,
            Err(Error::LimitExceeded(_)) => return self.reject(Status::PAYLOAD_TOO_LARGE),
            Err(e) => return self.abort(e),
        };
        let (size, extension) = match parse_chunk_line(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(peer = ?self.inner.peer, error = %e, "malformed chunk size line");
                return self.reject(Status::BAD_REQUEST);
            }
        };

        if size == 0 {
            return self.read_trailer_line(head, extension, Vec::new());
        }
        if size > self.inner.options.max_body_size {
            tracing::debug!(peer = ?self.inner.peer, size, "chunk too large");
            return self.reject(Status::PAYLOAD_TOO_LARGE);
        }

        self.set_state(ConnState::AwaitChunkData);
        let conn = self.clone();
        let result = self.inner.stream.read_bytes(size, move |result| match result {
            Ok(data) => conn.on_chunk_data(head, extension, data),
            Err(e) => conn.abort(e),
        });
        if let Err(e) = result {
            self.abort(e);
        }
    }

    // CRLF is read on its own so at most `size` bytes are ever buffered
    fn on_chunk_data(&self, head: Rc<RequestHead>, extension: Option<String>, data: Bytes) {
        let chunk = Chunk {
            size: data.len(),
            extension,
            data: Some(data),
        };
        let conn = self.clone();
        let result = self
            .inner
            .stream
            .read_bytes(LINE_TERMINATOR.len(), move |result| match result {
                Ok(terminator) => conn.on_chunk_end(head, chunk, terminator),
                Err(e) => conn.abort(e),
            });
        if let Err(e) = result {
            self.abort(e);
        }
    }

    fn on_chunk_end(&self, head: Rc<RequestHead>, chunk: Chunk, terminator: Bytes) {
        if terminator.as_ref() != LINE_TERMINATOR {
            tracing::debug!(peer = ?self.inner.peer, "chunk data not terminated by CRLF");
            return self.reject(Status::BAD_REQUEST);
        }
        if self.dispatch(Rc::clone(&head), RequestUnit::Chunk(chunk)) {
            self.read_chunk_line(head);
        }
    }

    fn read_trailer_line(&self, head: Rc<RequestHead>, extension: Option<String>, block: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        let remaining = self.inner.options.max_header_size.saturating_sub(block.len());
        if remaining == 0 {
            return self.reject(Status::PAYLOAD_TOO_LARGE);
        }
        self.set_state(ConnState::AwaitTrailers);

        let conn = self.clone();
        let result = self
            .inner
            .stream
            .read_until_max(LINE_TERMINATOR, remaining, move |result| {
                conn.on_trailer_line(head, extension, block, result)
            });
        if let Err(e) = result {
            self.abort(e);
        }
    }

    fn on_trailer_line(
        &self,
        head: Rc<RequestHead>,
        extension: Option<String>,
        mut block: Vec<u8>,
        result: Result<Bytes>,
    ) {
        let line = match result {
            Ok(line) => line,
            Err(Error::LimitExceeded(_)) => return self.reject(Status::PAYLOAD_TOO_LARGE),
            Err(e) => return self.abort(e),
        };
        if &line[..] != LINE_TERMINATOR {
            block.extend_from_slice(&line);
            return self.read_trailer_line(head, extension, block);
        }

        if block.is_empty() && !head.declares_trailers() {
            let last = Chunk {
                size: 0,
                extension,
                data: None,
            };
            self.dispatch(head, RequestUnit::LastChunk(last));
            return;
        }

        let parsed = std::str::from_utf8(&block)
            .map_err(|e| Error::Parse(format!("trailers are not valid UTF-8: {}", e)))
            .and_then(Headers::parse_block);
        match parsed {
            Ok(trailers) => {
                self.dispatch(head, RequestUnit::Trailers(trailers));
            }
            Err(e) => {
                tracing::debug!(peer = ?self.inner.peer, error = %e, "malformed trailers");
                self.reject(Status::BAD_REQUEST);
            }
        }
    }

    /// Hand one unit to the application; false when the connection should
    /// stop reading
    fn dispatch(&self, head: Rc<RequestHead>, unit: RequestUnit) -> bool {
        let last = unit.is_final();
        if last {
            self.inner.request_done.set(true);
            self.set_state(ConnState::AwaitFinish);
        }

        let handler = Rc::clone(&self.inner.handler);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handler.handle_request(self, &head, unit)
        }));

        if let Err(panic) = outcome {
            tracing::error!(
                peer = ?self.inner.peer,
                method = %head.method,
                uri = %head.uri,
                message = panic_message(&panic),
                "request handler panicked"
            );
            if self.inner.wrote_anything.get() {
                self.close_after_flush();
            } else {
                self.reject(Status::INTERNAL_SERVER_ERROR);
            }
            return false;
        }

        if last {
            self.maybe_finish_request();
        }
        !self.is_closed()
    }

    fn note_written(&self, data: &[u8]) {
        self.inner.wrote_anything.set(true);
        if self.inner.request.borrow().is_some() {
            self.inner.response.borrow_mut().feed(data);
        }
    }

    fn on_write_complete(&self) {
        let callback = self.inner.write_callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback();
        }

        if self.inner.close_pending.get() && !self.inner.stream.writing() {
            self.close();
            return;
        }
        self.maybe_finish_request();
    }

    fn maybe_finish_request(&self) {
        let ready = self.inner.request.borrow().is_some()
            && self.inner.finished.get()
            && self.inner.request_done.get()
            && !self.inner.stream.writing();
        if ready {
            self.finish_request();
        }
    }

    fn finish_request(&self) {
        let Some(head) = self.inner.request.borrow_mut().take() else {
            return;
        };
        let close = self.should_close(&head);

        let callback = self.inner.finish_callback.borrow_mut().take();
        if let Some(callback) = callback {
            run_guarded("connection finish callback", callback);
        }

        if close || self.inner.close_pending.get() {
            tracing::trace!(peer = ?self.inner.peer, "closing after response");
            self.close();
        } else {
            self.await_request();
        }
    }

    fn should_close(&self, head: &RequestHead) -> bool {
        if self.inner.options.no_keep_alive || head.wants_close() {
            return true;
        }
        let idempotent_read = matches!(head.method, Method::Get | Method::Head);
        match self.inner.response.borrow().head() {
            Some(response) => response.wants_close() || (!response.is_framed() && !idempotent_read),
            None => !idempotent_read,
        }
    }

    /// Write a fixed error response and close once it is sent
    fn reject(&self, status: Status) {
        tracing::debug!(peer = ?self.inner.peer, status = status.code(), "rejecting request");
        self.inner.close_pending.set(true);
        self.inner.request.borrow_mut().take();
        self.set_state(ConnState::AwaitFinish);

        let conn = self.clone();
        let result = self
            .inner
            .stream
            .write_with(error_response(status, false), move || conn.close());
        if result.is_err() {
            self.close();
        }
    }

    fn close_after_flush(&self) {
        self.inner.close_pending.set(true);
        if !self.inner.stream.writing() {
            self.close();
        }
    }

    fn abort(&self, error: Error) {
        match error {
            Error::StreamClosed => {}
            e => tracing::debug!(peer = ?self.inner.peer, error = %e, "connection aborted"),
        }
        self.close();
    }

    fn on_stream_closed(&self) {
        self.inner.state.set(ConnState::Closed);
        self.cancel_idle_timer();
        self.inner.request.borrow_mut().take();
        let write_callback = self.inner.write_callback.borrow_mut().take();
        drop(write_callback);
        let finish_callback = self.inner.finish_callback.borrow_mut().take();
        drop(finish_callback);

        if let Some(error) = self.inner.stream.error() {
            tracing::debug!(peer = ?self.inner.peer, error = %error, "closed with error");
        }

        let callback = self.inner.close_callback.borrow_mut().take();
        if let Some(callback) = callback {
            run_guarded("connection close callback", callback);
        }
        let hook = self.inner.release_hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}
