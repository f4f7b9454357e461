//! webloop - single-threaded epoll HTTP/1.1 server
//!
//! This crate provides a callback-driven event loop, buffered non-blocking
//! streams (plain and TLS) on top of it, and an HTTP/1.1 connection state
//! machine that hands parsed requests to an application handler.

pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod ioloop;
pub mod iostream;
pub mod registry;
pub mod tls;

pub use error::{Error, Result};
