//! webloop server binary
//!
//! ```bash
//! webloop --config webloop.yaml --port 8080 --handler echo
//! WEBLOOP_PORT=8080 RUST_LOG=webloop=debug webloop
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::{io, mem, ptr, thread};
use tracing_subscriber::EnvFilter;
use webloop::config::ServerConfig;
use webloop::http::{HttpServer, RequestHandler};
use webloop::ioloop::{EventLoop, LoopHandle};

#[derive(Debug, Parser)]
#[command(name = "webloop", version, about = "Single-threaded epoll HTTP/1.1 server")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "WEBLOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind (overrides the file; empty binds all interfaces)
    #[arg(long, env = "WEBLOOP_HOST")]
    host: Option<String>,

    /// Port to bind (overrides the file)
    #[arg(short, long, env = "WEBLOOP_PORT")]
    port: Option<u16>,

    /// Registered request handler to serve
    #[arg(long, env = "WEBLOOP_HANDLER")]
    handler: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> webloop::Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(handler) = args.handler {
        config.handler = handler;
    }
    config.validate()?;

    let registry = webloop::app::default_registry()?;
    let handler = registry.lookup::<dyn RequestHandler>(&config.handler)?;

    // Blocked before any other thread exists so every thread inherits the mask
    let signals = block_shutdown_signals()?;

    let io_loop = EventLoop::with_config(config.loop_config())?;
    let server = HttpServer::new(&io_loop, config, handler)?;
    server.listen()?;
    for addr in server.local_addrs() {
        tracing::info!(%addr, "serving");
    }

    spawn_signal_waiter(signals, io_loop.handle())?;
    let result = io_loop.start();

    server.stop();
    io_loop.close()?;
    tracing::info!("shutdown complete");
    result
}

fn block_shutdown_signals() -> io::Result<libc::sigset_t> {
    // SAFETY: the set is initialised by sigemptyset before any other use
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(set)
    }
}

/// Wait for SIGINT/SIGTERM on a dedicated thread and stop the loop
fn spawn_signal_waiter(set: libc::sigset_t, handle: LoopHandle) -> io::Result<()> {
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || loop {
            let mut signal: libc::c_int = 0;
            // SAFETY: `set` holds signals blocked on every thread
            let rc = unsafe { libc::sigwait(&set, &mut signal) };
            if rc != 0 {
                tracing::error!(error = %io::Error::from_raw_os_error(rc), "sigwait failed");
                return;
            }
            tracing::info!(signal, "shutdown signal received");
            handle.stop();
        })?;
    Ok(())
}
