//! A multi-ring `io_uring` TCP server engine: one ring per worker thread,
//! a framed-message wire protocol (`<len:8><body><0x00>`), and a
//! single-owner allocation registry so no I/O completion path can leak or
//! double-free a buffer.
//!
//! The moving parts, in the order most callers will reach for them:
//!
//! - [`config::Config`] — construction-time tunables.
//! - [`callbacks::Callbacks`] — the `on_connected`/`on_message`/`on_wrote`/
//!   `on_closed`/`on_error` hook set, closing over shared user state.
//! - [`engine::Engine`] — `create` → `bind_listener` → `set_callbacks` →
//!   `start` → `send`/`stop`.
//!
//! [`reassembler`], [`alloc_list`], [`scheduler`], and [`ring_pool`] are the
//! subsystems `Engine` composes; they are public because their algorithms
//! (framing, allocation bookkeeping, multi-queue dispatch, ring selection)
//! are independently useful and independently testable.

pub mod alloc_list;
pub mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod reassembler;
pub mod request;
pub mod ring_pool;
pub mod scheduler;

pub use callbacks::Callbacks;
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
