//! Single-threaded event loop
//!
//! The loop owns one epoll instance, a table of descriptor handlers, a
//! timeout heap and two deferred-callback queues. One iteration:
//!
//! 1. swap out and run the deferred callbacks (cross-thread queue first,
//!    then the loop-thread queue),
//! 2. run every expired timeout,
//! 3. pick a poll timeout (zero if work just ran or is already queued,
//!    otherwise bounded by the next deadline and the configured maximum),
//! 4. poll, retrying on `EINTR`,
//! 5. merge readiness into the pending-event map and drain it one entry at
//!    a time, re-reading the map after every handler.
//!
//! Panics raised by callbacks, timeouts and descriptor handlers are caught
//! and logged; only an error from `epoll_wait` itself ends [`EventLoop::start`].
//!
//! [`EventLoop`] is `!Send`. The only thing other threads may touch is a
//! [`LoopHandle`], which can queue `Send` callbacks and stop the loop.

mod poller;
mod timer;
mod waker;

pub use poller::Ready;
pub use timer::{Deadline, Timeout};
pub use waker::Waker;

use crate::{Error, Result};
use poller::Poller;
use timer::TimerHeap;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Descriptor readiness handler
pub type Handler = Rc<dyn Fn(RawFd, Ready)>;

type LocalCallback = Box<dyn FnOnce()>;
type RemoteCallback = Box<dyn FnOnce() + Send>;

/// Loop tuning knobs
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Upper bound for a single poll wait
    pub max_poll_timeout: Duration,
    /// Warn once the number of watched descriptors exceeds this
    pub fd_warning_threshold: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            max_poll_timeout: Duration::from_secs(3600),
            fd_warning_threshold: 1024,
        }
    }
}

/// State shared with other threads
struct Shared {
    remote: Mutex<Vec<RemoteCallback>>,
    waker: Waker,
    running: AtomicBool,
    stopped: AtomicBool,
    thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn on_loop_thread(&self) -> bool {
        let owner = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        *owner == Some(thread::current().id())
    }

    fn has_remote(&self) -> bool {
        !self
            .remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Thread-safe handle to an [`EventLoop`]
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Queue a callback to run on the loop thread.
    ///
    /// Wakes the loop when the queue was empty and the caller is another
    /// thread.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let was_empty = {
            let mut queue = self
                .shared
                .remote
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let was_empty = queue.is_empty();
            queue.push(Box::new(callback));
            was_empty
        };

        if was_empty && !self.shared.on_loop_thread() {
            self.shared.waker.wake();
        }
    }

    /// Ask the loop to return from `start` after the current iteration
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.waker.wake();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

struct Inner {
    poller: RefCell<Poller>,
    shared: Arc<Shared>,
    waker_fd: RawFd,
    handlers: RefCell<HashMap<RawFd, Handler>>,
    pending_events: RefCell<HashMap<RawFd, Ready>>,
    callbacks: RefCell<Vec<LocalCallback>>,
    timers: RefCell<TimerHeap>,
    config: LoopConfig,
    closed: Cell<bool>,
}

/// Epoll-driven event loop; cloning yields another handle to the same loop
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> Result<Self> {
        let poller = Poller::new()?;
        let waker = Waker::new()?;
        let waker_fd = waker.reader_fd();

        let shared = Arc::new(Shared {
            remote: Mutex::new(Vec::new()),
            waker,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let io_loop = EventLoop {
            inner: Rc::new(Inner {
                poller: RefCell::new(poller),
                shared: Arc::clone(&shared),
                waker_fd,
                handlers: RefCell::new(HashMap::new()),
                pending_events: RefCell::new(HashMap::new()),
                callbacks: RefCell::new(Vec::new()),
                timers: RefCell::new(TimerHeap::new()),
                config,
                closed: Cell::new(false),
            }),
        };

        io_loop.add_handler(waker_fd, move |_, _| shared.waker.drain(), Ready::READ)?;
        Ok(io_loop)
    }

    /// Handle usable from other threads
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Watch `fd` for `interest`; `ERROR` is always added
    pub fn add_handler<F>(&self, fd: RawFd, handler: F, interest: Ready) -> Result<()>
    where
        F: Fn(RawFd, Ready) + 'static,
    {
        if self.inner.closed.get() {
            return Err(Error::LoopClosed);
        }
        if self.inner.handlers.borrow().contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }

        self.inner
            .poller
            .borrow()
            .register(fd, interest | Ready::ERROR)?;

        let watched = {
            let mut handlers = self.inner.handlers.borrow_mut();
            handlers.insert(fd, Rc::new(handler));
            handlers.len() - 1
        };

        if watched > self.inner.config.fd_warning_threshold {
            tracing::warn!(
                watched,
                threshold = self.inner.config.fd_warning_threshold,
                "watched descriptor count above threshold"
            );
        }
        Ok(())
    }

    /// Change the interest mask of a registered descriptor
    pub fn update_handler(&self, fd: RawFd, interest: Ready) -> Result<()> {
        self.inner
            .poller
            .borrow()
            .modify(fd, interest | Ready::ERROR)?;
        Ok(())
    }

    /// Stop watching `fd`; unknown descriptors are ignored
    pub fn remove_handler(&self, fd: RawFd) {
        let removed = self.inner.handlers.borrow_mut().remove(&fd);
        self.inner.pending_events.borrow_mut().remove(&fd);

        if let Err(e) = self.inner.poller.borrow().deregister(fd) {
            tracing::debug!(fd, error = %e, "error deleting fd from epoll");
        }
        drop(removed);
    }

    /// Run `callback` once `deadline` has passed
    pub fn add_timeout<D, F>(&self, deadline: D, callback: F) -> Timeout
    where
        D: Into<Deadline>,
        F: FnOnce() + 'static,
    {
        let when = deadline.into().resolve(Instant::now());
        self.inner.timers.borrow_mut().push(when, Box::new(callback))
    }

    /// Cancel a timeout; cancelling twice is harmless
    pub fn remove_timeout(&self, timeout: &Timeout) {
        timeout.cancel();
    }

    /// Queue a callback for the next iteration (loop thread only)
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.callbacks.borrow_mut().push(Box::new(callback));
    }

    /// Same as [`LoopHandle::stop`]
    pub fn stop(&self) {
        self.handle().stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.running.load(Ordering::SeqCst)
    }

    /// Number of registered descriptors, not counting the waker
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.borrow().len().saturating_sub(1)
    }

    /// Run until [`stop`](Self::stop) is observed.
    ///
    /// A `stop` issued while the loop was not running makes the next call
    /// return immediately. The loop exits on the `stopped` flag alone, so a
    /// `stop` racing with `start` is never lost.
    pub fn start(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::LoopClosed);
        }
        if self.inner.shared.stopped.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        *self
            .inner
            .shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        self.inner.shared.running.store(true, Ordering::SeqCst);

        let result = self.run();

        self.inner.shared.running.store(false, Ordering::SeqCst);
        self.inner.shared.stopped.store(false, Ordering::SeqCst);
        *self
            .inner
            .shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        result
    }

    fn run(&self) -> Result<()> {
        let mut ready = Vec::new();

        loop {
            let ran = self.run_callbacks();

            let now = Instant::now();
            let mut fired = 0;
            loop {
                let next = self.inner.timers.borrow_mut().pop_expired(now);
                match next {
                    Some(callback) => {
                        fired += 1;
                        run_guarded("timeout", callback);
                    }
                    None => break,
                }
            }

            let timeout = if ran + fired > 0 || self.has_pending_callbacks() {
                Duration::ZERO
            } else {
                let max = self.inner.config.max_poll_timeout;
                match self.inner.timers.borrow_mut().next_deadline() {
                    Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(max),
                    None => max,
                }
            };

            if self.inner.shared.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }

            let polled = self.inner.poller.borrow_mut().poll(Some(timeout), &mut ready);
            match polled {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "poll failed");
                    return Err(e.into());
                }
            }

            {
                let mut pending = self.inner.pending_events.borrow_mut();
                for (fd, events) in ready.drain(..) {
                    *pending.entry(fd).or_default() |= events;
                }
            }

            // Handlers may add or remove descriptors, so the map is re-read
            // after every dispatch instead of iterating a snapshot.
            while let Some((fd, events)) = self.next_pending_event() {
                let handler = self.inner.handlers.borrow().get(&fd).cloned();
                if let Some(handler) = handler {
                    run_guarded("descriptor handler", || handler(fd, events));
                }
            }
        }
    }

    fn next_pending_event(&self) -> Option<(RawFd, Ready)> {
        let mut pending = self.inner.pending_events.borrow_mut();
        let fd = *pending.keys().next()?;
        pending.remove(&fd).map(|events| (fd, events))
    }

    fn has_pending_callbacks(&self) -> bool {
        !self.inner.callbacks.borrow().is_empty() || self.inner.shared.has_remote()
    }

    /// Run everything queued so far; callbacks queued meanwhile wait for
    /// the next iteration
    fn run_callbacks(&self) -> usize {
        let remote = std::mem::take(
            &mut *self
                .inner
                .shared
                .remote
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let local = std::mem::take(&mut *self.inner.callbacks.borrow_mut());
        let count = remote.len() + local.len();

        for callback in remote {
            run_guarded("callback", callback);
        }
        for callback in local {
            run_guarded("callback", callback);
        }
        count
    }

    /// Release every handler, timeout and queued callback.
    ///
    /// Fails while the loop is running; the loop cannot be started again.
    pub fn close(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::LoopRunning);
        }
        if self.inner.closed.replace(true) {
            return Ok(());
        }

        let fds: Vec<RawFd> = self.inner.handlers.borrow().keys().copied().collect();
        for fd in fds {
            self.remove_handler(fd);
        }
        self.inner.timers.borrow_mut().clear();
        let callbacks = std::mem::take(&mut *self.inner.callbacks.borrow_mut());
        drop(callbacks);
        self.inner
            .shared
            .remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        tracing::debug!(waker = self.inner.waker_fd, "event loop closed");
        Ok(())
    }
}

/// Run a user callback, logging a panic instead of unwinding the loop
pub(crate) fn run_guarded<F: FnOnce()>(what: &'static str, callback: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!(what, message = panic_message(&panic), "callback panicked");
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
