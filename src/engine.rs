//! Ties the [`RingPool`](crate::ring_pool::RingPool), the
//! [`AllocList`](crate::alloc_list::AllocList), the
//! [`Scheduler`](crate::scheduler::Scheduler) and the user's
//! [`Callbacks`](crate::callbacks::Callbacks) together behind the
//! `create` → `bind_listener` → `set_callbacks` → `start` → `send`/`stop`
//! lifecycle.
//!
//! Ring `0` is the *master*: it alone holds the accept queue. Rings
//! `1..N` are *slaves*. Every ring also carries a wake-up read so `stop()`
//! can pull every worker out of its completion wait. Accept completions
//! hand the new connection's first read to `RingPool::next_index()`,
//! striping fresh connections across every ring (including the master)
//! round-robin.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use io_uring::{opcode, types};

use crate::alloc_list::{AllocList, RequestId};
use crate::callbacks::Callbacks;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame;
use crate::reassembler;
use crate::request::{Chunk, Cursor, Request, RequestKind};
use crate::ring_pool::{RingPool, WAKE_USER_DATA};
use crate::scheduler::Scheduler;

/// Maps a client descriptor to the scheduler sub-queue that serialises its
/// callbacks. Queue `0` is reserved for the scheduler's own bookkeeping, so
/// every connection queue is offset by one.
fn fd_qid(fd: RawFd) -> u32 {
    (fd as u32).wrapping_add(1)
}

/// Tracks how many ring workers have entered their completion loop, for
/// [`Engine::start`] to block on, plus the stopped flag [`Engine::stop`]
/// flips once.
#[derive(Default)]
struct StatusInner {
    started: usize,
    stopped: bool,
}

struct Status {
    inner: Mutex<StatusInner>,
    condvar: Condvar,
}

impl Status {
    fn new() -> Status {
        Status {
            inner: Mutex::new(StatusInner::default()),
            condvar: Condvar::new(),
        }
    }

    fn mark_worker_started(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.started += 1;
        drop(inner);
        self.condvar.notify_all();
    }

    fn wait_until_started(&self, total: usize) {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .condvar
            .wait_while(guard, |s| s.started < total)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Number of workers observed started so far (for tests/operators).
    fn started_workers(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).started
    }

    fn mark_stopped(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stopped = true;
    }
}

/// Everything the ring worker threads need, shared behind one `Arc` so a
/// completion handler can reach the callbacks, the scheduler, and the other
/// rings without a back-pointer to `Engine` itself.
struct Shared<T> {
    config: Config,
    ring_pool: RingPool,
    alloc_list: AllocList,
    scheduler: Scheduler,
    callbacks: OnceLock<Callbacks<T>>,
    listener_fd: Mutex<Option<RawFd>>,
    status: Status,
    stopping: AtomicBool,
    /// Descriptors already handed to `close_connection`, so a read error and
    /// a write error racing on the same fd can't double-close it.
    closing: Mutex<HashSet<RawFd>>,
}

impl<T> Shared<T> {
    fn callbacks(&self) -> Option<&Callbacks<T>> {
        self.callbacks.get()
    }
}

/// The engine: owns the ring pool, the allocation list, the scheduler, and
/// the user's callback set; drives the four subsystems to accept
/// connections, reassemble frames, and dispatch callbacks.
///
/// `T` is the opaque user state closed over by every callback in the
/// [`Callbacks<T>`] bundle handed to [`Engine::set_callbacks`].
pub struct Engine<T> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
    destroyed: AtomicBool,
}

impl<T: Send + Sync + 'static> Engine<T> {
    /// Creates the ring pool and scheduler for `config.resolved_worker_count()`
    /// workers. Does not spawn any threads yet; see [`Engine::start`].
    pub fn create(config: Config) -> Result<Engine<T>> {
        let worker_count = config.resolved_worker_count();
        log::info!(
            "creating engine: {worker_count} workers (requested {}), chunk size {} bytes, ring depth {}",
            config.worker_count(),
            config.chunk_size(),
            config.ring_depth(),
        );
        let ring_pool = RingPool::new(worker_count, config.ring_depth())?;
        let scheduler = Scheduler::start(worker_count)?;
        let shared = Arc::new(Shared {
            config,
            ring_pool,
            alloc_list: AllocList::new(),
            scheduler,
            callbacks: OnceLock::new(),
            listener_fd: Mutex::new(None),
            status: Status::new(),
            stopping: AtomicBool::new(false),
            closing: Mutex::new(HashSet::new()),
        });
        Ok(Engine {
            shared,
            workers: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Registers the already-`listen()`-ed descriptor the master worker
    /// accepts connections on. Must be called before [`Engine::start`].
    pub fn bind_listener(&self, fd: RawFd) {
        *self.shared.listener_fd.lock().unwrap_or_else(|e| e.into_inner()) = Some(fd);
    }

    /// Registers the callback set. A second call is ignored (logged), since
    /// the documented contract runs `set_callbacks` exactly once between
    /// `create` and `start`.
    pub fn set_callbacks(&self, callbacks: Callbacks<T>) {
        if self.shared.callbacks.set(callbacks).is_err() {
            log::warn!("set_callbacks called more than once; keeping the first set");
        }
    }

    /// Spawns one thread per ring and blocks until every one of them has
    /// entered its completion-wait loop.
    pub fn start(&self) -> Result<()> {
        let n = self.shared.ring_pool.len();
        let mut handles = Vec::with_capacity(n);
        for ring_index in 0..n {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("ringserver-ring-{ring_index}"))
                .spawn(move || worker_loop(shared, ring_index))
                .map_err(|e| Error::WorkerSpawn(e.to_string()))?;
            handles.push(handle);
        }
        *self.workers.lock().unwrap_or_else(|e| e.into_inner()) = Some(handles);
        self.shared.status.wait_until_started(n);
        log::info!("engine started with {n} workers");
        Ok(())
    }

    /// Number of ring workers that have entered their loop so far. Exposed
    /// for tests that need to wait for "all workers up" without a sleep.
    pub fn started_workers(&self) -> usize {
        self.shared.status.started_workers()
    }

    /// Frames `body` and submits it as a write on the next round-robin ring.
    /// Errors here are limited to resource exhaustion building the request;
    /// transient submission-queue pressure and short writes are retried
    /// internally.
    pub fn send(&self, fd: RawFd, body: impl Into<Vec<u8>>) -> Result<()> {
        let framed = frame::encode(&body.into())?;
        let request = Request::new(RequestKind::Write, fd, vec![Chunk::from_bytes(framed)]);
        let ring_index = self.shared.ring_pool.next_index();
        post_write(&self.shared, ring_index, request)?;
        self.shared.ring_pool.ring(ring_index).submit()?;
        Ok(())
    }

    /// Wakes every ring worker and joins their threads, then waits for every
    /// scheduler sub-queue to drain. Idempotent: a second call is a no-op.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            log::debug!("stop() called more than once; ignoring");
            return;
        }
        log::info!("stopping engine: waking {} ring workers", self.shared.ring_pool.len());
        for i in 0..self.shared.ring_pool.len() {
            if let Err(e) = self.shared.ring_pool.ring(i).wake() {
                log::warn!("failed to wake ring {i}: {e}");
            }
        }
        if let Some(handles) = self.workers.lock().unwrap_or_else(|e| e.into_inner()).take() {
            for handle in handles {
                let _ = handle.join();
            }
        }
        self.shared.scheduler.wait_empty();
        self.shared.status.mark_stopped();
        log::info!("engine stopped");
    }

    /// Joins the scheduler's own threads and frees every resource the
    /// engine still owns: outstanding requests, and the listening
    /// descriptor. Calls [`Engine::stop`] first if it hasn't run yet, so
    /// `destroy` alone is always a safe, complete shutdown. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        self.shared.scheduler.stop();
        self.shared.alloc_list.free_all();
        let listener = self
            .shared
            .listener_fd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(fd) = listener {
            unsafe {
                libc::close(fd);
            }
        }
        log::info!("engine destroyed");
    }
}

impl<T> Drop for Engine<T> {
    fn drop(&mut self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.stop();
            self.shared.scheduler.stop();
            self.shared.alloc_list.free_all();
            let listener = self
                .shared
                .listener_fd
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(fd) = listener {
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}

fn worker_loop<T: Send + Sync + 'static>(shared: Arc<Shared<T>>, ring_index: usize) {
    let ring = shared.ring_pool.ring(ring_index);
    if let Err(e) = ring.arm_wake_read(shared.config.retry_sleep()) {
        log::error!("worker {ring_index}: failed to arm wake read: {e}; not starting");
        return;
    }
    if ring_index == 0 {
        if let Err(e) = post_accept(&shared, ring_index) {
            log::error!("worker {ring_index}: failed to post initial accept: {e}");
        }
    }
    if let Err(e) = ring.submit() {
        log::error!("worker {ring_index}: initial submit failed: {e}; not starting");
        return;
    }

    shared.status.mark_worker_started();
    log::debug!("worker {ring_index}: entering completion loop");

    loop {
        if let Err(e) = ring.submit_and_wait() {
            log::error!("worker {ring_index}: completion wait failed: {e}; leaving loop");
            return;
        }

        let mut completions = Vec::new();
        ring.drain_completions(|user_data, result| completions.push((user_data, result)));

        for (user_data, result) in completions {
            if user_data == WAKE_USER_DATA {
                if shared.stopping.load(Ordering::Acquire) {
                    log::debug!("worker {ring_index}: wake observed during shutdown; exiting");
                    return;
                }
                if let Err(e) = ring.arm_wake_read(shared.config.retry_sleep()) {
                    log::error!("worker {ring_index}: failed to re-arm wake read: {e}");
                }
                continue;
            }
            handle_completion(&shared, ring_index, user_data, result);
        }
    }
}

fn handle_completion<T: Send + Sync + 'static>(
    shared: &Arc<Shared<T>>,
    ring_index: usize,
    id: RequestId,
    result: i32,
) {
    let Some(node) = shared.alloc_list.remove(id) else {
        log::warn!("completion for unknown request {id}; ignoring");
        return;
    };
    let request = node.request;
    match request.kind {
        RequestKind::Accept => handle_accept(shared, ring_index, result),
        RequestKind::Read => handle_read(shared, ring_index, request, result),
        RequestKind::Write => handle_write(shared, ring_index, request, result),
        RequestKind::Wake => {
            // Wake completions never go through the allocation list; they
            // carry `WAKE_USER_DATA` and are handled in `worker_loop`.
        }
    }
}

fn handle_accept<T: Send + Sync + 'static>(shared: &Arc<Shared<T>>, ring_index: usize, result: i32) {
    if result >= 0 {
        let fd = result as RawFd;
        if let Err(e) = shared.scheduler.new_queue(fd_qid(fd), 1) {
            log::warn!("queue for fd {fd} already existed: {e}");
        }
        dispatch_connected(shared, fd);
        let target_ring = shared.ring_pool.next_index();
        if let Err(e) = post_read(shared, target_ring, fd, Cursor::default()) {
            log::error!("failed to post initial read for fd {fd}: {e}");
            close_connection(shared, fd);
        }
    } else {
        let err = std::io::Error::from_raw_os_error(-result);
        log::warn!("accept failed: {err}");
    }

    if let Err(e) = post_accept(shared, ring_index) {
        log::error!("worker {ring_index}: failed to re-post accept: {e}");
    }
}

fn handle_read<T: Send + Sync + 'static>(
    shared: &Arc<Shared<T>>,
    ring_index: usize,
    mut request: Request,
    result: i32,
) {
    let fd = request.fd;

    if result == 0 {
        log::debug!("fd {fd}: peer closed the connection");
        close_connection(shared, fd);
        return;
    }
    if result < 0 {
        let err = std::io::Error::from_raw_os_error(-result);
        dispatch_error(shared, fd, format!("read failed: {err}"));
        close_connection(shared, fd);
        return;
    }

    request.chunks[0].set_len(result as usize);
    let outcome = reassembler::reassemble(
        &request.chunks,
        &mut request.cursor,
        shared.config.max_resync_failures(),
    );

    for body in outcome.deliveries {
        dispatch_message(shared, fd, body);
    }
    for message in outcome.errors {
        dispatch_error(shared, fd, message);
    }

    if outcome.fatal {
        dispatch_error(
            shared,
            fd,
            "too many consecutive corruption resyncs; closing connection".to_string(),
        );
        close_connection(shared, fd);
        return;
    }

    if let Err(e) = post_read(shared, ring_index, fd, request.cursor) {
        log::error!("failed to re-post read for fd {fd}: {e}");
        close_connection(shared, fd);
    }
}

/// A write completion reporting fewer bytes than the buffer holds is a
/// short write, not a failure: the kernel flushed a prefix and the rest
/// still needs to go out. Resubmits the remainder on the same ring rather
/// than reporting a truncated `on_wrote`.
fn handle_write<T: Send + Sync + 'static>(
    shared: &Arc<Shared<T>>,
    ring_index: usize,
    mut request: Request,
    result: i32,
) {
    let fd = request.fd;
    if result < 0 {
        let err = std::io::Error::from_raw_os_error(-result);
        dispatch_error(shared, fd, format!("write failed: {err}"));
        return;
    }

    request.written += result as usize;
    let total_len = request.chunks[0].filled().len();
    if request.written < total_len {
        if let Err(e) = post_write(shared, ring_index, request) {
            log::error!("failed to resubmit short write for fd {fd}: {e}");
            dispatch_error(shared, fd, format!("failed to resubmit short write: {e}"));
        }
        return;
    }

    dispatch_wrote(shared, fd, request.written);
}

/// Posts (or re-posts) a read on `fd`, carrying `cursor` forward whether it
/// is clean or mid-reassembly — either way the next completion needs a
/// fresh chunk to land in. Routed to `ring_index` so at most one read per
/// descriptor is ever in flight on a given ring.
fn post_read<T: Send + Sync + 'static>(
    shared: &Arc<Shared<T>>,
    ring_index: usize,
    fd: RawFd,
    cursor: Cursor,
) -> Result<()> {
    let chunk = Chunk::new(shared.config.chunk_size())?;
    let request = Request::continuation(fd, vec![chunk], cursor);
    let id = shared.alloc_list.insert(request);
    let ptr = shared
        .alloc_list
        .with_request_mut(id, |req| req.chunks[0].as_mut_ptr())
        .expect("request was just inserted");

    let ring = shared.ring_pool.ring(ring_index);
    let entry = opcode::Read::new(types::Fd(fd), ptr, shared.config.chunk_size() as u32)
        .build()
        .user_data(id);
    ring.push(&entry, shared.config.retry_sleep())
}

/// Submits (or resubmits) a write for `request`, starting at
/// `request.written` so a short write only resends the unflushed tail.
fn post_write<T: Send + Sync + 'static>(
    shared: &Arc<Shared<T>>,
    ring_index: usize,
    request: Request,
) -> Result<()> {
    let fd = request.fd;
    let written = request.written;
    let id = shared.alloc_list.insert(request);
    let (ptr, len) = shared
        .alloc_list
        .with_request_mut(id, |req| {
            let chunk = &req.chunks[0];
            let remaining = chunk.filled().len() - written;
            let ptr = unsafe { chunk.as_ptr().add(written) };
            (ptr, remaining)
        })
        .expect("request was just inserted");

    let ring = shared.ring_pool.ring(ring_index);
    let entry = opcode::Write::new(types::Fd(fd), ptr, len as u32)
        .build()
        .user_data(id);
    ring.push(&entry, shared.config.retry_sleep())
}

fn post_accept<T: Send + Sync + 'static>(shared: &Arc<Shared<T>>, ring_index: usize) -> Result<()> {
    let Some(listener_fd) = *shared.listener_fd.lock().unwrap_or_else(|e| e.into_inner()) else {
        log::warn!("worker {ring_index}: no listener bound yet; not posting accept");
        return Ok(());
    };

    let request = Request::new(RequestKind::Accept, listener_fd, Vec::new());
    let id = shared.alloc_list.insert(request);
    let ring = shared.ring_pool.ring(ring_index);
    let entry = opcode::Accept::new(types::Fd(listener_fd), std::ptr::null_mut(), std::ptr::null_mut())
        .build()
        .user_data(id);
    ring.push(&entry, shared.config.retry_sleep())
}

fn dispatch_connected<T: Send + Sync + 'static>(shared: &Arc<Shared<T>>, fd: RawFd) {
    let task_shared = Arc::clone(shared);
    if let Err(e) = shared.scheduler.add(fd_qid(fd), move || {
        if let Some(callbacks) = task_shared.callbacks() {
            callbacks.fire_connected(fd);
        }
    }) {
        log::warn!("dropping on_connected for fd {fd}: {e}");
    }
}

fn dispatch_message<T: Send + Sync + 'static>(shared: &Arc<Shared<T>>, fd: RawFd, body: Vec<u8>) {
    let task_shared = Arc::clone(shared);
    if let Err(e) = shared.scheduler.add(fd_qid(fd), move || {
        if let Some(callbacks) = task_shared.callbacks() {
            callbacks.fire_message(fd, body);
        }
    }) {
        log::warn!("dropping message for fd {fd}: {e}");
    }
}

fn dispatch_wrote<T: Send + Sync + 'static>(shared: &Arc<Shared<T>>, fd: RawFd, bytes: usize) {
    let task_shared = Arc::clone(shared);
    if let Err(e) = shared.scheduler.add(fd_qid(fd), move || {
        if let Some(callbacks) = task_shared.callbacks() {
            callbacks.fire_wrote(fd, bytes);
        }
    }) {
        log::warn!("dropping on_wrote for fd {fd}: {e}");
    }
}

fn dispatch_error<T: Send + Sync + 'static>(shared: &Arc<Shared<T>>, fd: RawFd, message: String) {
    let task_shared = Arc::clone(shared);
    if let Err(e) = shared.scheduler.add(fd_qid(fd), move || {
        if let Some(callbacks) = task_shared.callbacks() {
            callbacks.fire_error(fd, message);
        }
    }) {
        log::warn!("dropping on_error for fd {fd}: {e}");
    }
}

/// Invokes `on_closed`, closes the descriptor, and retires its scheduler
/// queue — all from within the queue itself, so it runs after every
/// `on_message`/`on_wrote` already enqueued for this fd. Guarded by
/// `Shared::closing` so a read error and a write error racing on the same
/// fd can't close it twice.
fn close_connection<T: Send + Sync + 'static>(shared: &Arc<Shared<T>>, fd: RawFd) {
    {
        let mut closing = shared.closing.lock().unwrap_or_else(|e| e.into_inner());
        if !closing.insert(fd) {
            return;
        }
    }

    let qid = fd_qid(fd);
    let task_shared = Arc::clone(shared);
    let enqueued = shared.scheduler.add(qid, move || {
        if let Some(callbacks) = task_shared.callbacks() {
            callbacks.fire_closed(fd);
        }
        unsafe {
            libc::close(fd);
        }
        let _ = task_shared.scheduler.remove_queue(qid);
        task_shared
            .closing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&fd);
    });

    if let Err(e) = enqueued {
        log::warn!("failed to enqueue close for fd {fd}: {e}; closing directly");
        if let Some(callbacks) = shared.callbacks() {
            callbacks.fire_closed(fd);
        }
        unsafe {
            libc::close(fd);
        }
        let _ = shared.scheduler.remove_queue(qid);
        shared.closing.lock().unwrap_or_else(|e| e.into_inner()).remove(&fd);
    }
}
