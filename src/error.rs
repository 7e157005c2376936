//! Error taxonomy for the engine.
//!
//! Transient failures (a full submission queue, a short write) are retried
//! internally and never reach this type. Everything that does reach a
//! caller falls into one of the variants below.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine and its subsystems.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A syscall or ring operation failed in a way that isn't part of the
    /// normal client lifecycle (connection reset, EOF, etc. are not errors).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The ring could not be created or entered a structurally unusable
    /// state. The worker that hit this leaves its loop; other workers are
    /// unaffected.
    #[error("ring failure: {0}")]
    RingFailure(String),

    /// A completed read failed reassembly: a non-zero footer, an
    /// out-of-range header, or similar. The connection survives; the
    /// discarded prefix is reported through `on_error`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Allocating buffers for a `Request` failed. The partially built
    /// request is unwound and nothing is delivered to the user.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// `new_queue` was called with a queue id that already exists.
    #[error("queue {0} already exists")]
    QueueExists(u32),

    /// A scheduler operation referenced a queue id that isn't registered.
    #[error("queue {0} not found")]
    QueueNotFound(u32),

    /// `add` was called after `stop` on the scheduler or engine.
    #[error("pool is stopped")]
    PoolStopped,

    /// `start` could not spawn the requested number of worker threads.
    #[error("failed to spawn worker: {0}")]
    WorkerSpawn(String),
}

impl Error {
    /// A connection-survives protocol error, built from a `Display`-able
    /// reason (kept as a free function instead of a `From` impl so call
    /// sites stay explicit about which taxonomy bucket they're using).
    pub(crate) fn protocol(reason: impl fmt::Display) -> Error {
        Error::Protocol(reason.to_string())
    }

    pub(crate) fn resource(reason: impl fmt::Display) -> Error {
        Error::Resource(reason.to_string())
    }

    pub(crate) fn ring_failure(reason: impl fmt::Display) -> Error {
        Error::RingFailure(reason.to_string())
    }
}
