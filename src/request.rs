//! A `Request` is the engine's record of one submitted ring operation: its
//! kind, its target descriptor, the chunk buffers the kernel will fill or
//! drain, and the reassembly [`Cursor`] carried across completions.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// The kind of ring operation a `Request` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Accept,
    Read,
    Write,
    Wake,
}

/// One fixed-size kernel buffer, addressed by base and reported length.
///
/// `len` starts at zero and is filled in by the engine once a completion
/// reports how many bytes the kernel actually produced (for reads) or
/// consumed (informational, for writes).
#[derive(Debug)]
pub struct Chunk {
    buf: Box<[u8]>,
    len: usize,
}

impl Chunk {
    /// Allocates a zeroed chunk of `capacity` bytes. Fails with
    /// [`Error::Resource`] instead of letting the allocator abort the
    /// process if the allocation can't be satisfied.
    pub fn new(capacity: usize) -> Result<Chunk> {
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|e| Error::resource(e))?;
        buf.resize(capacity, 0);
        Ok(Chunk {
            buf: buf.into_boxed_slice(),
            len: 0,
        })
    }

    /// Wraps caller-supplied bytes as a chunk whose `len` is the full
    /// buffer, used for outbound write requests where nothing is "filled"
    /// by the kernel.
    pub fn from_bytes(bytes: Vec<u8>) -> Chunk {
        let len = bytes.len();
        Chunk {
            buf: bytes.into_boxed_slice(),
            len,
        }
    }

    /// Mutable pointer to the start of the buffer, for handing to the ring.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    /// Read-only pointer to the start of the buffer, for handing to the ring.
    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    /// Total capacity of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes actually valid in this chunk (set by the engine after a
    /// completion reports a byte count).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records how many bytes a completion reported for this chunk.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.len = len.min(self.buf.len());
    }

    /// The valid portion of the buffer.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Position state the [`reassembler`](crate::reassembler) carries across
/// reads: where an in-progress body stands, and where the next header scan
/// should resume.
#[derive(Debug, Default)]
pub struct Cursor {
    /// Buffer for an in-progress reassembly, or `None` if the stream is
    /// clean at a frame boundary.
    pub prev: Option<Vec<u8>>,
    /// Total expected body length of `prev`.
    pub prev_size: usize,
    /// Bytes still to receive for `prev`.
    pub prev_remain: usize,
    /// Chunk index where the next header begins, when resuming mid-vector.
    pub next_iov: usize,
    /// Byte offset inside `next_iov` where the next header begins.
    pub next_offset: usize,
    /// Consecutive corruption-resync failures observed on this request.
    pub resync_failures: u32,
    /// Header bytes collected so far when a read ended mid-header (fewer
    /// than 8 bytes available). Empty when no header is in progress.
    pub(crate) pending_header: Vec<u8>,
    /// Set while resynchronising after corruption and no `0x00` byte has
    /// been found yet; the next read resumes the footer scan from its start
    /// rather than trying to decode a header.
    pub(crate) scanning_for_footer: bool,
}

impl Cursor {
    pub fn is_clean(&self) -> bool {
        self.prev.is_none() && self.prev_size == 0 && self.prev_remain == 0
    }

    pub fn clear_continuation(&mut self) {
        self.prev = None;
        self.prev_size = 0;
        self.prev_remain = 0;
    }

    pub fn clear_position(&mut self) {
        self.next_iov = 0;
        self.next_offset = 0;
    }
}

/// The engine's record of one submitted async I/O operation.
#[derive(Debug)]
pub struct Request {
    pub kind: RequestKind,
    pub fd: RawFd,
    pub chunks: Vec<Chunk>,
    pub cursor: Cursor,
    /// Bytes already flushed for a `Write` request whose kernel completion
    /// reported fewer bytes than the buffer held; zero for every other kind.
    pub written: usize,
}

impl Request {
    pub fn new(kind: RequestKind, fd: RawFd, chunks: Vec<Chunk>) -> Request {
        Request {
            kind,
            fd,
            chunks,
            cursor: Cursor::default(),
            written: 0,
        }
    }

    /// Builds a continuation read request that reuses the previous
    /// request's in-progress cursor, so a reassembly spanning multiple
    /// reads picks up exactly where the last one left off.
    pub fn continuation(fd: RawFd, chunks: Vec<Chunk>, cursor: Cursor) -> Request {
        Request {
            kind: RequestKind::Read,
            fd,
            chunks,
            cursor,
            written: 0,
        }
    }
}
