//! User-supplied hooks invoked as the engine observes connection and
//! message lifecycle events.
//!
//! The original engine passed each hook as a bare C function pointer plus a
//! `void *` the caller was trusted to cast back. Rust has a safe
//! replacement for that pairing: an `Arc<dyn Fn(...) + Send + Sync>` per
//! hook closing over whatever state the caller needs, plus one shared
//! `Arc<T>` of typed user state threaded through every call instead of an
//! untyped pointer.

use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

type Hook<T, A> = Arc<dyn Fn(&T, A) + Send + Sync>;

/// The hooks an [`Engine`](crate::engine::Engine) invokes, plus the shared
/// state they close over.
///
/// Every invocation is wrapped in [`catch_unwind`]: a panicking callback
/// cannot take down a worker thread or leave the engine's internal state
/// half-updated. A caught panic is logged and otherwise discarded.
pub struct Callbacks<T> {
    state: Arc<T>,
    on_connected: Option<Hook<T, RawFd>>,
    on_message: Option<Hook<T, (RawFd, Vec<u8>)>>,
    on_wrote: Option<Hook<T, (RawFd, usize)>>,
    on_closed: Option<Hook<T, RawFd>>,
    on_error: Option<Hook<T, (RawFd, String)>>,
}

impl<T> Clone for Callbacks<T> {
    fn clone(&self) -> Callbacks<T> {
        Callbacks {
            state: Arc::clone(&self.state),
            on_connected: self.on_connected.clone(),
            on_message: self.on_message.clone(),
            on_wrote: self.on_wrote.clone(),
            on_closed: self.on_closed.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> Callbacks<T> {
    /// Builds an empty hook set over `state`; every hook is a no-op until
    /// set with the corresponding `with_*` method.
    pub fn new(state: Arc<T>) -> Callbacks<T> {
        Callbacks {
            state,
            on_connected: None,
            on_message: None,
            on_wrote: None,
            on_closed: None,
            on_error: None,
        }
    }

    pub fn with_on_connected(mut self, f: impl Fn(&T, RawFd) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    pub fn with_on_message(
        mut self,
        f: impl Fn(&T, (RawFd, Vec<u8>)) + Send + Sync + 'static,
    ) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn with_on_wrote(mut self, f: impl Fn(&T, (RawFd, usize)) + Send + Sync + 'static) -> Self {
        self.on_wrote = Some(Arc::new(f));
        self
    }

    pub fn with_on_closed(mut self, f: impl Fn(&T, RawFd) + Send + Sync + 'static) -> Self {
        self.on_closed = Some(Arc::new(f));
        self
    }

    pub fn with_on_error(
        mut self,
        f: impl Fn(&T, (RawFd, String)) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn state(&self) -> &Arc<T> {
        &self.state
    }

    pub fn fire_connected(&self, fd: RawFd) {
        invoke(&self.on_connected, &self.state, fd, "on_connected");
    }

    pub fn fire_message(&self, fd: RawFd, body: Vec<u8>) {
        invoke(&self.on_message, &self.state, (fd, body), "on_message");
    }

    pub fn fire_wrote(&self, fd: RawFd, bytes: usize) {
        invoke(&self.on_wrote, &self.state, (fd, bytes), "on_wrote");
    }

    pub fn fire_closed(&self, fd: RawFd) {
        invoke(&self.on_closed, &self.state, fd, "on_closed");
    }

    pub fn fire_error(&self, fd: RawFd, message: String) {
        invoke(&self.on_error, &self.state, (fd, message), "on_error");
    }
}

fn invoke<T, A>(hook: &Option<Hook<T, A>>, state: &Arc<T>, arg: A, name: &str) {
    let Some(hook) = hook else { return };
    let result = catch_unwind(AssertUnwindSafe(|| hook(state, arg)));
    if result.is_err() {
        log::error!("callback {name} panicked; continuing");
    }
}
