//! HTTP/1.1 server side for webloop
//!
//! This module turns accepted byte streams into parsed requests and hands
//! them to an application [`RequestHandler`].
//!
//! # Architecture
//!
//! The HTTP layer is a callback-driven state machine on top of
//! [`IoStream`](crate::iostream::IoStream):
//!
//! - `parser` and `headers` turn the raw header block into a [`RequestHead`]
//! - `chunked` parses chunk-size lines and encodes chunked replies
//! - `connection` owns one stream, reads one request at a time (no
//!   pipelining), dispatches whole bodies, single chunks or trailers, and
//!   decides keep-alive once the application calls `finish()`
//! - `server` binds the listening sockets and builds a connection per
//!   accepted socket
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use webloop::config::ServerConfig;
//! use webloop::http::{HttpConnection, HttpServer, RequestHandler, RequestHead, RequestUnit};
//! use webloop::ioloop::EventLoop;
//!
//! struct Hello;
//!
//! impl RequestHandler for Hello {
//!     fn handle_request(&self, conn: &HttpConnection, _head: &RequestHead, _unit: RequestUnit) {
//!         let _ = conn.write(&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"[..]);
//!         let _ = conn.finish();
//!     }
//! }
//!
//! let io_loop = EventLoop::new().unwrap();
//! let server = HttpServer::new(&io_loop, ServerConfig::default(), Rc::new(Hello)).unwrap();
//! server.start().unwrap();
//! ```

pub mod chunked;
pub mod connection;
pub mod headers;
pub mod message;
pub mod parser;
pub mod server;

pub use connection::{ConnState, ConnectionOptions, HttpConnection, RequestHandler};
pub use headers::Headers;
pub use message::{Chunk, Method, RequestHead, RequestUnit, ResponseHead, Status, Version};
pub use server::HttpServer;

pub(crate) use crate::{Error, Result};

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 100;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
