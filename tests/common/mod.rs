//! Shared helpers for integration tests
//!
//! The server and its event loop run on the test thread; clients are plain
//! blocking sockets on helper threads that stop the loop when they are done.

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use webloop::config::ServerConfig;
use webloop::http::{HttpConnection, HttpServer, RequestHandler, RequestHead, RequestUnit};
use webloop::ioloop::EventLoop;

pub const OK_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

pub struct TestServer {
    pub io_loop: EventLoop,
    pub server: HttpServer,
    pub addr: SocketAddr,
}

/// Loopback configuration on an ephemeral port
pub fn local_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    }
}

pub fn start_server(config: ServerConfig, handler: Rc<dyn RequestHandler>) -> TestServer {
    let io_loop = EventLoop::new().unwrap();
    let server = HttpServer::new(&io_loop, config, handler).unwrap();
    server.listen().unwrap();
    let addr = server.local_addrs()[0];
    TestServer {
        io_loop,
        server,
        addr,
    }
}

/// Run `client` on a thread against the server until it returns
pub fn run_client<T, F>(server: &TestServer, client: F) -> T
where
    T: Send + 'static,
    F: FnOnce(SocketAddr) -> T + Send + 'static,
{
    let addr = server.addr;
    let handle = server.io_loop.handle();
    let worker = thread::spawn(move || {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| client(addr)));
        handle.stop();
        outcome
    });

    let stopper = server.io_loop.clone();
    let watchdog = server
        .io_loop
        .add_timeout(Duration::from_secs(10), move || stopper.stop());
    server.io_loop.start().unwrap();
    server.io_loop.remove_timeout(&watchdog);

    match worker.join().unwrap() {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Read one response framed by `Content-Length` (or nothing): head and body
pub fn read_response<S: Read>(stream: &mut S) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        if n == 0 {
            let partial = String::from_utf8_lossy(&head);
            panic!("connection closed inside response head: {:?}", partial);
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();

    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

pub fn read_to_end<S: Read>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

pub fn send<S: Write>(stream: &mut S, data: &[u8]) {
    stream.write_all(data).unwrap();
}

/// What a [`Recorder`] saw for one unit
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Full {
        method: String,
        uri: String,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },
    Chunk {
        size: usize,
        data: Vec<u8>,
    },
    LastChunk,
    Trailers(Vec<(String, String)>),
}

/// Records every dispatched unit and answers complete requests with `reply`
pub struct Recorder {
    pub events: RefCell<Vec<Event>>,
    reply: &'static [u8],
}

impl Recorder {
    pub fn new(reply: &'static [u8]) -> Rc<Self> {
        Rc::new(Recorder {
            events: RefCell::new(Vec::new()),
            reply,
        })
    }
}

impl RequestHandler for Recorder {
    fn handle_request(&self, conn: &HttpConnection, head: &RequestHead, unit: RequestUnit) {
        let last = unit.is_final();
        let event = match unit {
            RequestUnit::Full { body } => Event::Full {
                method: head.method.to_string(),
                uri: head.uri.clone(),
                headers: head
                    .headers
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect(),
                body: body.map(|b| b.to_vec()),
            },
            RequestUnit::Chunk(chunk) => Event::Chunk {
                size: chunk.size,
                data: chunk.data.map(|d| d.to_vec()).unwrap_or_default(),
            },
            RequestUnit::LastChunk(_) => Event::LastChunk,
            RequestUnit::Trailers(trailers) => Event::Trailers(
                trailers
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect(),
            ),
        };
        self.events.borrow_mut().push(event);

        if last {
            conn.write(self.reply).unwrap();
            conn.finish().unwrap();
        }
    }
}

/// Self-signed certificate and key for `localhost`, in one PEM file
pub fn write_identity(dir: &Path) -> PathBuf {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "localhost").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(7).unwrap()).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let path = dir.join("identity.pem");
    let mut pem = cert.to_pem().unwrap();
    pem.extend_from_slice(&key.private_key_to_pem_pkcs8().unwrap());
    std::fs::write(&path, pem).unwrap();
    path
}
