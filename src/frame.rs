//! The wire format: `<header:8 bytes BE><body:N bytes><footer:1 byte = 0x00>`.
//!
//! Rust's `u64::to_be_bytes`/`from_be_bytes` already give us portable 64-bit
//! byte-order conversions, so unlike the original (which hand-rolled
//! `htonll`/`ntohll` because POSIX `htonl`/`ntohl` are only 32-bit) there is
//! no platform-specific helper to write here.

use crate::error::{Error, Result};

/// Length, in bytes, of the big-endian body-length header.
pub const HEADER_LEN: usize = 8;

/// The sentinel byte that terminates every frame.
pub const FOOTER: u8 = 0x00;

/// Encodes `body` as a complete wire frame: header, body, footer. Fails with
/// [`Error::Resource`] rather than aborting the process if the allocator
/// can't satisfy the frame's backing buffer.
pub fn encode(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.try_reserve_exact(HEADER_LEN + body.len() + 1)
        .map_err(|e| Error::resource(e))?;
    out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    out.extend_from_slice(body);
    out.push(FOOTER);
    Ok(out)
}

/// Decodes an 8-byte big-endian header into a body length.
pub fn decode_header(bytes: [u8; HEADER_LEN]) -> u64 {
    u64::from_be_bytes(bytes)
}
