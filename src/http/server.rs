//! HTTP server
//!
//! Binds the listening sockets, accepts clients from the event loop and
//! builds an [`HttpConnection`] for each of them.

use super::connection::{ConnectionOptions, HttpConnection, RequestHandler};
use super::{Error, Result};
use crate::config::{Family, ServerConfig};
use crate::ioloop::{EventLoop, Ready};
use crate::iostream::{FdSessionOps, IoStream, SessionOps};
use crate::tls::TlsConfig;

use socket2::{Domain, Protocol, Socket, Type};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

struct ServerInner {
    io_loop: EventLoop,
    config: ServerConfig,
    handler: Rc<dyn RequestHandler>,
    tls: RefCell<Option<TlsConfig>>,
    listeners: RefCell<Vec<TcpListener>>,
    listening: Cell<bool>,
    stopped: Cell<bool>,
    connections: RefCell<HashMap<u64, HttpConnection>>,
    next_id: Cell<u64>,
}

/// Single-threaded HTTP/1.1 server; clones share the same server
#[derive(Clone)]
pub struct HttpServer {
    inner: Rc<ServerInner>,
}

impl HttpServer {
    /// Create a server; TLS is enabled when `config.tls` is set
    pub fn new(
        io_loop: &EventLoop,
        config: ServerConfig,
        handler: Rc<dyn RequestHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let tls = match &config.tls {
            Some(settings) => Some(TlsConfig::from_settings(settings)?),
            None => None,
        };

        Ok(HttpServer {
            inner: Rc::new(ServerInner {
                io_loop: io_loop.clone(),
                config,
                handler,
                tls: RefCell::new(tls),
                listeners: RefCell::new(Vec::new()),
                listening: Cell::new(false),
                stopped: Cell::new(false),
                connections: RefCell::new(HashMap::new()),
                next_id: Cell::new(0),
            }),
        })
    }

    /// Serve TLS with `tls` instead of whatever the configuration said
    pub fn with_tls(self, tls: TlsConfig) -> Self {
        *self.inner.tls.borrow_mut() = Some(tls);
        self
    }

    /// Open one listening socket per resolved address; a no-op once bound
    pub fn bind(&self) -> Result<()> {
        if !self.inner.listeners.borrow().is_empty() {
            return Ok(());
        }
        let config = &self.inner.config;
        let addrs = resolve(&config.host, config.port, config.family)?;

        let mut listeners = Vec::with_capacity(addrs.len());
        let mut last_error = None;
        let mut port = config.port;
        for mut addr in addrs {
            // An ephemeral port is shared by every address family
            if config.port == 0 && port != 0 {
                addr.set_port(port);
            }
            match bind_listener(addr, config.backlog) {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    port = local.port();
                    tracing::info!(addr = %local, "listening");
                    listeners.push(listener);
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "failed to bind");
                    last_error = Some(e);
                }
            }
        }

        if listeners.is_empty() {
            return Err(match last_error {
                Some(e) => e.into(),
                None => Error::Config(format!(
                    "no address to bind for {:?} port {}",
                    config.host, config.port
                )),
            });
        }
        *self.inner.listeners.borrow_mut() = listeners;
        Ok(())
    }

    /// Bind if needed and start accepting on the event loop
    pub fn listen(&self) -> Result<()> {
        if self.inner.stopped.get() {
            return Err(Error::Config("server has been stopped".to_string()));
        }
        self.bind()?;
        if self.inner.listening.replace(true) {
            return Ok(());
        }

        let fds: Vec<_> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|listener| listener.as_raw_fd())
            .collect();
        for (index, fd) in fds.into_iter().enumerate() {
            let weak: Weak<ServerInner> = Rc::downgrade(&self.inner);
            self.inner.io_loop.add_handler(
                fd,
                move |_, _| {
                    if let Some(inner) = weak.upgrade() {
                        HttpServer { inner }.accept_ready(index);
                    }
                },
                Ready::READ,
            )?;
        }
        Ok(())
    }

    /// Listen, then run the event loop until it is stopped
    pub fn start(&self) -> Result<()> {
        self.listen()?;
        self.inner.io_loop.start()
    }

    /// Stop accepting and close every connection; later calls do nothing
    pub fn stop(&self) {
        if self.inner.stopped.replace(true) {
            return;
        }
        tracing::info!(connections = self.connection_count(), "stopping server");

        let listeners = std::mem::take(&mut *self.inner.listeners.borrow_mut());
        if self.inner.listening.replace(false) {
            for listener in &listeners {
                self.inner.io_loop.remove_handler(listener.as_raw_fd());
            }
        }
        drop(listeners);

        let connections: Vec<_> = self
            .inner
            .connections
            .borrow_mut()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            conn.close();
        }
    }

    /// Addresses actually bound (ephemeral ports resolved)
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .listeners
            .borrow()
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Open connections
    pub fn connection_count(&self) -> usize {
        self.inner.connections.borrow().len()
    }

    fn accept_ready(&self, index: usize) {
        loop {
            let accepted = {
                let listeners = self.inner.listeners.borrow();
                let Some(listener) = listeners.get(index) else {
                    return;
                };
                listener.accept()
            };

            match accepted {
                Ok((tcp, peer)) => {
                    if let Err(e) = self.adopt(tcp, peer) {
                        tracing::warn!(peer = %peer, error = %e, "failed to set up connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.raw_os_error() == Some(libc::ECONNABORTED) =>
                {
                    continue
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Wrap an accepted socket; on error the socket is dropped and closed
    fn adopt(&self, tcp: TcpStream, peer: SocketAddr) -> Result<()> {
        tcp.set_nonblocking(true)?;
        tcp.set_nodelay(true)?;

        let config = &self.inner.config;
        let session: Box<dyn SessionOps> = match self.inner.tls.borrow().as_ref() {
            Some(tls) => Box::new(tls.accept(tcp)?),
            None => Box::new(FdSessionOps::new(tcp)),
        };
        let stream = IoStream::new(&self.inner.io_loop, session, config.stream_options())?;
        let conn = HttpConnection::new(
            stream,
            Some(peer),
            Rc::clone(&self.inner.handler),
            ConnectionOptions::from(config),
        );

        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let weak = Rc::downgrade(&self.inner);
        conn.set_release_hook(move || {
            if let Some(inner) = weak.upgrade() {
                inner.connections.borrow_mut().remove(&id);
            }
        });

        tracing::debug!(peer = %peer, id, "accepted connection");
        self.inner.connections.borrow_mut().insert(id, conn);
        Ok(())
    }
}

/// Resolve `host:port` into the addresses to bind, in resolver order with
/// duplicates removed. An empty host means every interface.
pub fn resolve(host: &str, port: u16, family: Family) -> Result<Vec<SocketAddr>> {
    let candidates: Vec<SocketAddr> = if host.is_empty() {
        vec![
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        ]
    } else {
        (host, port).to_socket_addrs()?.collect()
    };

    let mut addrs: Vec<SocketAddr> = Vec::with_capacity(candidates.len());
    for addr in candidates {
        if family.admits(&addr) && !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    Ok(addrs)
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}
