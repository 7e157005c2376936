//! Construction-time tunables for an [`Engine`](crate::engine::Engine).
//!
//! Loading these from a file or the command line is out of scope for this
//! crate; callers build a `Config`, override what they need, and hand it to
//! [`Engine::create`](crate::engine::Engine::create).

/// Default size, in bytes, of a single chunk buffer used for ring reads.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Default submission/completion queue depth for each ring.
pub const DEFAULT_RING_DEPTH: u32 = 256;

/// Default backlog passed to `listen` by the socket's creator (informational
/// only; this crate never calls `listen` itself).
pub const DEFAULT_ACCEPT_BACKLOG: i32 = 10;

/// Default spin-sleep interval, in microseconds, when a submission queue is
/// momentarily full.
pub const DEFAULT_RETRY_SLEEP_MICROS: u64 = 10;

/// Default number of consecutive corruption-resync failures tolerated on one
/// connection before it is force-closed.
pub const DEFAULT_MAX_RESYNC_FAILURES: u32 = 3;

/// Tunables for an [`Engine`](crate::engine::Engine) instance.
///
/// Construct with [`Config::new`] and chain the `with_*` setters, or use
/// [`Default::default`] for the documented defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub(crate) worker_count: usize,
    pub(crate) chunk_size: usize,
    pub(crate) ring_depth: u32,
    pub(crate) accept_backlog: i32,
    pub(crate) retry_sleep_micros: u64,
    pub(crate) max_resync_failures: u32,
}

impl Config {
    /// Creates a config requesting `worker_count` workers. The count is
    /// clamped to `[2, num_cpus]` when the engine is created, not here, so
    /// the clamp can be logged with the detected CPU count.
    pub fn new(worker_count: usize) -> Config {
        Config {
            worker_count,
            ..Config::default()
        }
    }

    /// Overrides the chunk size used for ring reads.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Config {
        self.chunk_size = chunk_size;
        self
    }

    /// Overrides the per-ring submission/completion queue depth.
    pub fn with_ring_depth(mut self, ring_depth: u32) -> Config {
        self.ring_depth = ring_depth;
        self
    }

    /// Overrides the informational accept backlog value.
    pub fn with_accept_backlog(mut self, accept_backlog: i32) -> Config {
        self.accept_backlog = accept_backlog;
        self
    }

    /// Overrides the spin-sleep interval used while waiting for a free
    /// submission slot.
    pub fn with_retry_sleep_micros(mut self, micros: u64) -> Config {
        self.retry_sleep_micros = micros;
        self
    }

    /// Overrides the number of consecutive resync failures tolerated before
    /// a connection is force-closed.
    pub fn with_max_resync_failures(mut self, max: u32) -> Config {
        self.max_resync_failures = max;
        self
    }

    /// The worker count as requested, before the `[2, num_cpus]` clamp.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// The configured chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The configured ring depth.
    pub fn ring_depth(&self) -> u32 {
        self.ring_depth
    }

    /// The configured retry-sleep interval.
    pub fn retry_sleep(&self) -> std::time::Duration {
        std::time::Duration::from_micros(self.retry_sleep_micros)
    }

    /// The configured max consecutive resync failures.
    pub fn max_resync_failures(&self) -> u32 {
        self.max_resync_failures
    }

    /// Clamps `self.worker_count` to `[2, num_cpus]`, returning the resolved
    /// worker count. Called once by `Engine::create`.
    pub(crate) fn resolved_worker_count(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        self.worker_count.clamp(2, cpus.max(2))
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            worker_count: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ring_depth: DEFAULT_RING_DEPTH,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            retry_sleep_micros: DEFAULT_RETRY_SLEEP_MICROS,
            max_resync_failures: DEFAULT_MAX_RESYNC_FAILURES,
        }
    }
}
