//! Built-in request handlers
//!
//! `hello` answers every request with a fixed greeting. `echo` sends the
//! request body back, re-chunking it when the request was chunked.

use crate::http::chunked::{encode_chunk, encode_last_chunk};
use crate::http::{
    HttpConnection, Method, RequestHandler, RequestHead, RequestUnit, ResponseHead, Status,
};
use crate::registry::{Registry, RegistryBuilder};
use crate::Result;

use bytes::Bytes;
use std::rc::Rc;

const GREETING: &str = "Hello, world!\n";

/// Log a failed write; the connection is already closing in that case
fn send(conn: &HttpConnection, data: impl Into<Bytes>) {
    if let Err(e) = conn.write(data) {
        tracing::debug!(peer = ?conn.peer_addr(), error = %e, "response write failed");
    }
}

fn finish(conn: &HttpConnection) {
    if let Err(e) = conn.finish() {
        tracing::debug!(peer = ?conn.peer_addr(), error = %e, "finish failed");
    }
}

/// Fixed greeting for any complete request
#[derive(Debug, Default)]
pub struct HelloHandler;

impl RequestHandler for HelloHandler {
    fn handle_request(&self, conn: &HttpConnection, head: &RequestHead, unit: RequestUnit) {
        if !unit.is_final() {
            return;
        }

        let response = ResponseHead::new(Status::OK)
            .header("Content-Type", "text/plain")
            .header("Content-Length", GREETING.len().to_string());
        send(conn, response.to_wire());
        if head.method != Method::Head {
            send(conn, GREETING);
        }
        finish(conn);
    }
}

/// Returns the request body
#[derive(Debug, Default)]
pub struct EchoHandler;

impl EchoHandler {
    fn start_chunked(conn: &HttpConnection) {
        if conn.response_started() {
            return;
        }
        let response = ResponseHead::new(Status::OK)
            .header("Content-Type", "application/octet-stream")
            .header("Transfer-Encoding", "chunked");
        send(conn, response.to_wire());
    }
}

impl RequestHandler for EchoHandler {
    fn handle_request(&self, conn: &HttpConnection, _head: &RequestHead, unit: RequestUnit) {
        match unit {
            RequestUnit::Full { body } => {
                let body = body.unwrap_or_default();
                let response = ResponseHead::new(Status::OK)
                    .header("Content-Type", "application/octet-stream")
                    .header("Content-Length", body.len().to_string());
                send(conn, response.to_wire());
                if !body.is_empty() {
                    send(conn, body);
                }
                finish(conn);
            }
            RequestUnit::Chunk(chunk) => {
                Self::start_chunked(conn);
                if let Some(data) = chunk.data {
                    send(conn, encode_chunk(&data));
                }
            }
            RequestUnit::LastChunk(_) => {
                Self::start_chunked(conn);
                send(conn, encode_last_chunk(None));
                finish(conn);
            }
            RequestUnit::Trailers(trailers) => {
                Self::start_chunked(conn);
                send(conn, encode_last_chunk(Some(&trailers)));
                finish(conn);
            }
        }
    }
}

/// Registry holding the built-in handlers
pub fn default_registry() -> Result<Registry> {
    let registry = RegistryBuilder::new()
        .register::<dyn RequestHandler>("hello", || -> Rc<dyn RequestHandler> {
            Rc::new(HelloHandler)
        })?
        .register::<dyn RequestHandler>("echo", || -> Rc<dyn RequestHandler> {
            Rc::new(EchoHandler)
        })?
        .freeze();
    Ok(registry)
}
