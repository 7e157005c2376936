//! Pure, synchronous logic that turns a completed read's chunk vector plus
//! carry-over [`Cursor`] state into zero or more complete message bodies.
//!
//! No I/O and no locking happens here: a clean stream resumes any
//! in-progress body, decodes as many fresh header/body/footer frames as the
//! available bytes allow, and falls back to scanning forward for the next
//! `0x00` footer when a completed body's footer byte isn't zero. It is
//! exercised directly by the scenario tests at the bottom of this file and
//! indirectly by the engine's loopback integration tests.

use crate::frame::{FOOTER, HEADER_LEN};
use crate::request::{Chunk, Cursor};

/// Result of one call to [`reassemble`].
#[derive(Debug, Default)]
pub struct Outcome {
    /// Fully reassembled message bodies, in the order they were completed.
    pub deliveries: Vec<Vec<u8>>,
    /// Human-readable descriptions of corruption events detected and
    /// resynchronised past during this call, surfaced via `on_error`.
    pub errors: Vec<String>,
    /// Whether the caller must post a continuation read to make further
    /// progress (an in-progress body, a split header, or an unresolved
    /// corruption scan).
    pub needs_continuation: bool,
    /// Whether `Config::max_resync_failures` consecutive corruption events
    /// were hit on this request; the caller should force-close the
    /// connection rather than keep resynchronising forever.
    pub fatal: bool,
}

/// Reassembles as many complete frames as possible out of `chunks`,
/// updating `cursor` in place for the next call.
///
/// Internally this operates over plain byte-slice segments rather than
/// `Chunk`s directly: that lets a pending partial header carried in the
/// cursor be spliced back in as a leading segment instead of needing its
/// own parallel codepath.
pub fn reassemble(chunks: &[Chunk], cursor: &mut Cursor, max_resync_failures: u32) -> Outcome {
    let pending_header = std::mem::take(&mut cursor.pending_header);
    let mut segments: Vec<&[u8]> = Vec::with_capacity(chunks.len() + 1);
    if !pending_header.is_empty() {
        segments.push(&pending_header);
    }
    segments.extend(chunks.iter().map(Chunk::filled));

    let mut out = Outcome::default();
    let mut pos = Position { iov: 0, offset: 0 };

    if cursor.scanning_for_footer {
        match find_footer(&segments, pos) {
            Some(found) => {
                pos = advance(&segments, found, 1);
                cursor.scanning_for_footer = false;
            }
            None => {
                out.needs_continuation = true;
                return out;
            }
        }
    } else if cursor.prev.is_some() {
        match resume(&segments, cursor, max_resync_failures, &mut out) {
            Resume::Delivered(next) => pos = next,
            Resume::Pending => return out,
            Resume::Fatal => {
                out.fatal = true;
                return out;
            }
        }
    } else {
        pos = Position {
            iov: cursor.next_iov,
            offset: cursor.next_offset,
        };
    }

    fresh_frames(&segments, pos, cursor, max_resync_failures, &mut out);
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Position {
    iov: usize,
    offset: usize,
}

enum Resume {
    /// The in-progress body was completed and its footer verified; framing
    /// continues at the returned position.
    Delivered(Position),
    /// Still waiting on more bytes (body incomplete or footer not yet
    /// available); the caller must post a continuation read.
    Pending,
    /// Too many consecutive corruption events on this request.
    Fatal,
}

/// Continues an in-progress reassembly left over from a previous read.
fn resume(
    segments: &[&[u8]],
    cursor: &mut Cursor,
    max_resync_failures: u32,
    out: &mut Outcome,
) -> Resume {
    let mut body = cursor.prev.take().expect("resume called with no prev");
    let size = cursor.prev_size;
    let mut remain = cursor.prev_remain;

    let pos = if remain > 0 {
        let dest_off = size - remain;
        let to_copy = remain.min(total_remaining(segments, Position { iov: 0, offset: 0 }));
        let (copied, pos) = copy_out(
            segments,
            Position { iov: 0, offset: 0 },
            &mut body[dest_off..dest_off + to_copy],
        );
        remain -= copied;
        pos
    } else {
        Position { iov: 0, offset: 0 }
    };

    if remain > 0 {
        cursor.prev = Some(body);
        cursor.prev_size = size;
        cursor.prev_remain = remain;
        cursor.clear_position();
        out.needs_continuation = true;
        return Resume::Pending;
    }

    finish_body(segments, pos, body, size, cursor, max_resync_failures, out)
}

/// Verifies the footer for a just-completed body, delivering it on success
/// or resynchronising on a non-zero footer. Shared between the resume path
/// and the fresh-frame path, since both can finish a body exactly at a
/// chunk-vector boundary (the "footer lands in the next read" edge case).
fn finish_body(
    segments: &[&[u8]],
    pos: Position,
    body: Vec<u8>,
    size: usize,
    cursor: &mut Cursor,
    max_resync_failures: u32,
    out: &mut Outcome,
) -> Resume {
    match byte_at(segments, pos) {
        Some(FOOTER) => {
            out.deliveries.push(body);
            cursor.clear_continuation();
            cursor.resync_failures = 0;
            Resume::Delivered(advance(segments, pos, 1))
        }
        Some(_) => {
            out.errors.push(format!(
                "non-zero footer after {size}-byte body; resynchronising"
            ));
            cursor.clear_continuation();
            if bump_resync_failures(cursor, max_resync_failures) {
                return Resume::Fatal;
            }
            match find_footer(segments, pos) {
                Some(found) => Resume::Delivered(advance(segments, found, 1)),
                None => {
                    cursor.scanning_for_footer = true;
                    out.needs_continuation = true;
                    Resume::Pending
                }
            }
        }
        None => {
            // Body complete, but the footer byte hasn't arrived yet: the
            // "body exactly equal to the remaining capacity" edge case.
            cursor.prev = Some(body);
            cursor.prev_size = size;
            cursor.prev_remain = 0;
            cursor.clear_position();
            out.needs_continuation = true;
            Resume::Pending
        }
    }
}

/// Decodes fresh frames starting at `pos` until the segment vector is
/// exhausted or a continuation/fatal condition is hit.
fn fresh_frames(
    segments: &[&[u8]],
    mut pos: Position,
    cursor: &mut Cursor,
    max_resync_failures: u32,
    out: &mut Outcome,
) {
    loop {
        if total_remaining(segments, pos) == 0 {
            cursor.next_iov = 0;
            cursor.next_offset = 0;
            return;
        }

        let (header, header_end) = match read_header(segments, pos) {
            Some(v) => v,
            None => {
                // Fewer than 8 bytes remain for the header: stash what we
                // have and wait for the rest to arrive on the next read.
                cursor.pending_header = tail_bytes(segments, pos);
                cursor.next_iov = 0;
                cursor.next_offset = 0;
                out.needs_continuation = true;
                return;
            }
        };

        if header == 0 && total_remaining(segments, header_end) == 0 {
            // Zero-length body with nothing left to confirm a footer on:
            // treat exactly like any other body that needs a continuation
            // for its footer, rather than as corruption.
            let body = Vec::new();
            match finish_body(segments, header_end, body, 0, cursor, max_resync_failures, out) {
                Resume::Delivered(next) => {
                    pos = next;
                    continue;
                }
                Resume::Pending => return,
                Resume::Fatal => {
                    out.fatal = true;
                    return;
                }
            }
        }

        let available = total_remaining(segments, header_end);
        let body_len = header as usize;

        if available >= body_len + 1 {
            let mut body = vec![0u8; body_len];
            let (_, body_end) = copy_out(segments, header_end, &mut body);
            match finish_body(
                segments,
                body_end,
                body,
                body_len,
                cursor,
                max_resync_failures,
                out,
            ) {
                Resume::Delivered(next) => {
                    pos = next;
                    continue;
                }
                Resume::Pending => return,
                Resume::Fatal => {
                    out.fatal = true;
                    return;
                }
            }
        }

        // Header looked valid but fewer than body+footer bytes remain:
        // either a legitimate continuation, or (if the header was bogus)
        // corruption that needs to resynchronise. We can't tell the two
        // apart until the footer shows up, so treat it as a continuation;
        // `max_resync_failures` still bounds true corruption because a
        // bogus header will fail its eventual footer check in `resume`.
        let mut body = vec![0u8; body_len];
        let (copied, _end) = copy_out(segments, header_end, &mut body);
        cursor.prev = Some(body);
        cursor.prev_size = body_len;
        cursor.prev_remain = body_len - copied;
        cursor.clear_position();
        out.needs_continuation = true;
        return;
    }
}

fn bump_resync_failures(cursor: &mut Cursor, max_resync_failures: u32) -> bool {
    cursor.resync_failures += 1;
    max_resync_failures > 0 && cursor.resync_failures >= max_resync_failures
}

fn byte_at(segments: &[&[u8]], pos: Position) -> Option<u8> {
    segments.get(pos.iov).and_then(|s| s.get(pos.offset).copied())
}

fn total_remaining(segments: &[&[u8]], pos: Position) -> usize {
    if pos.iov >= segments.len() {
        return 0;
    }
    let mut total = segments[pos.iov].len().saturating_sub(pos.offset);
    for segment in &segments[pos.iov + 1..] {
        total += segment.len();
    }
    total
}

fn advance(segments: &[&[u8]], mut pos: Position, mut n: usize) -> Position {
    while n > 0 && pos.iov < segments.len() {
        let avail = segments[pos.iov].len().saturating_sub(pos.offset);
        if avail == 0 {
            pos.iov += 1;
            pos.offset = 0;
            continue;
        }
        let take = avail.min(n);
        pos.offset += take;
        n -= take;
        if pos.offset >= segments[pos.iov].len() {
            pos.iov += 1;
            pos.offset = 0;
        }
    }
    pos
}

/// Reads an 8-byte big-endian header starting at `pos`, pulling bytes
/// across segment boundaries if necessary. Returns `None` if fewer than 8
/// bytes are currently available.
fn read_header(segments: &[&[u8]], pos: Position) -> Option<(u64, Position)> {
    let mut bytes = [0u8; HEADER_LEN];
    let mut cur = pos;
    for b in bytes.iter_mut() {
        *b = byte_at(segments, cur)?;
        cur = advance(segments, cur, 1);
    }
    Some((u64::from_be_bytes(bytes), cur))
}

/// Collects whatever bytes remain from `pos` onward, used to stash a
/// partial header across a read boundary.
fn tail_bytes(segments: &[&[u8]], pos: Position) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cur = pos;
    while let Some(b) = byte_at(segments, cur) {
        out.push(b);
        cur = advance(segments, cur, 1);
    }
    out
}

/// Copies `dest.len()` bytes starting at `pos`, across segment boundaries.
/// Returns the number of bytes actually copied (less than `dest.len()` only
/// if the segment vector runs out) and the position just past the copy.
fn copy_out(segments: &[&[u8]], mut pos: Position, dest: &mut [u8]) -> (usize, Position) {
    let mut copied = 0;
    while copied < dest.len() && pos.iov < segments.len() {
        let segment = segments[pos.iov];
        let avail = segment.len().saturating_sub(pos.offset);
        if avail == 0 {
            pos.iov += 1;
            pos.offset = 0;
            continue;
        }
        let want = dest.len() - copied;
        let take = avail.min(want);
        dest[copied..copied + take].copy_from_slice(&segment[pos.offset..pos.offset + take]);
        copied += take;
        pos.offset += take;
        if pos.offset >= segment.len() {
            pos.iov += 1;
            pos.offset = 0;
        }
    }
    (copied, pos)
}

/// Scans forward from `pos` for the next `0x00` byte, used to resynchronise
/// after a corrupted frame. Returns its position (the footer byte itself),
/// not the position after it.
fn find_footer(segments: &[&[u8]], mut pos: Position) -> Option<Position> {
    while pos.iov < segments.len() {
        let segment = segments[pos.iov];
        while pos.offset < segment.len() {
            if segment[pos.offset] == FOOTER {
                return Some(pos);
            }
            pos.offset += 1;
        }
        pos.iov += 1;
        pos.offset = 0;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    fn chunk_of(bytes: &[u8]) -> Chunk {
        let mut c = Chunk::new(bytes.len()).expect("alloc");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), c.as_mut_ptr(), bytes.len());
        }
        c.set_len(bytes.len());
        c
    }

    fn run(bytes: &[u8], cursor: &mut Cursor) -> Outcome {
        let chunks = vec![chunk_of(bytes)];
        reassemble(&chunks, cursor, 3)
    }

    #[test]
    fn scenario_single_short_message() {
        let mut cursor = Cursor::default();
        let wire = frame::encode(b"Hola, Mundo!").expect("encode");
        let out = run(&wire, &mut cursor);
        assert_eq!(out.deliveries, vec![b"Hola, Mundo!".to_vec()]);
        assert!(cursor.is_clean());
    }

    #[test]
    fn scenario_body_spanning_multiple_chunks() {
        let chunk_size = 8192usize;
        let pattern = b"abcdefghijklmnopqrstuvwxyz";
        let body: Vec<u8> = pattern
            .iter()
            .cycle()
            .take(chunk_size + chunk_size / 2)
            .copied()
            .collect();
        let wire = frame::encode(&body).expect("encode");

        // Split the wire into chunk_size-sized reads, as the ring would.
        let mut cursor = Cursor::default();
        let mut deliveries = Vec::new();
        for piece in wire.chunks(chunk_size) {
            let chunks = vec![chunk_of(piece)];
            let out = reassemble(&chunks, &mut cursor, 3);
            deliveries.extend(out.deliveries);
        }
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0], body);
        assert!(cursor.is_clean());
    }

    #[test]
    fn scenario_three_packed_messages_in_one_chunk() {
        let mut wire = Vec::new();
        wire.extend(frame::encode(&[1, 2, 3]).expect("encode"));
        wire.extend(frame::encode(&[1, 2, 3, 4]).expect("encode"));
        wire.extend(frame::encode(&[1, 2, 3, 4, 5]).expect("encode"));

        let mut cursor = Cursor::default();
        let out = run(&wire, &mut cursor);
        assert_eq!(out.deliveries.len(), 3);
        assert_eq!(out.deliveries[0].len(), 3);
        assert_eq!(out.deliveries[1].len(), 4);
        assert_eq!(out.deliveries[2].len(), 5);
        assert!(cursor.is_clean());
    }

    #[test]
    fn scenario_carry_over_across_three_reads() {
        let chunk_size = 8192usize;
        let body = vec![b'x'; (chunk_size * 5) / 2];
        let wire = frame::encode(&body).expect("encode");
        let pieces: Vec<&[u8]> = wire.chunks(chunk_size).collect();
        assert!(pieces.len() >= 3, "need at least 3 reads for this scenario");

        let mut cursor = Cursor::default();
        let out1 = reassemble(&[chunk_of(pieces[0])], &mut cursor, 3);
        assert!(out1.deliveries.is_empty());
        assert!(out1.needs_continuation);

        let out2 = reassemble(&[chunk_of(pieces[1])], &mut cursor, 3);
        assert!(out2.deliveries.is_empty());
        assert!(out2.needs_continuation);

        let mut all = Vec::new();
        for piece in &pieces[2..] {
            let out = reassemble(&[chunk_of(piece)], &mut cursor, 3);
            all.extend(out.deliveries);
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], body);
    }

    #[test]
    fn scenario_corrupted_middle_frame_resynchronises() {
        // Three frames: 10, 40, 50 bytes. Zero out the middle footer and
        // shift the third header forward by 10 bytes of junk.
        let f1 = frame::encode(&vec![1u8; 10]).expect("encode");
        let mut f2 = frame::encode(&vec![2u8; 40]).expect("encode");
        *f2.last_mut().unwrap() = 0xFF; // corrupt the footer
        let f3 = frame::encode(&vec![3u8; 50]).expect("encode");

        let mut wire = Vec::new();
        wire.extend(&f1);
        wire.extend(&f2);
        wire.extend(vec![0xAAu8; 10]); // extra junk shifting the next header
        wire.extend(&f3);

        let mut cursor = Cursor::default();
        let out = run(&wire, &mut cursor);

        assert_eq!(out.deliveries[0], vec![1u8; 10]);
        assert!(!out.errors.is_empty(), "expected a protocol error to be reported");
        assert!(!out.fatal);
        // After resynchronising the reassembler finds *a* footer (0x00) and
        // keeps scanning for the next plausible frame; with enough garbage
        // it may take more than one resync step, but it must not wedge.
        assert!(cursor.resync_failures <= 3);
    }

    #[test]
    fn three_consecutive_corrupted_frames_are_fatal() {
        // Each frame's footer is corrupted and immediately followed by a
        // lone 0x00, so every call resynchronises within the same frame and
        // ends the read at a clean position — only `resync_failures` carries
        // over between calls, exactly as it would across three separate
        // kernel reads of back-to-back garbage.
        fn corrupt_frame(body: &[u8]) -> Vec<u8> {
            let mut framed = frame::encode(body).expect("encode");
            *framed.last_mut().unwrap() = 0xFF;
            framed.push(0x00);
            framed
        }

        let mut cursor = Cursor::default();
        for _ in 0..2 {
            let out = run(&corrupt_frame(&[1u8; 8]), &mut cursor);
            assert!(out.deliveries.is_empty());
            assert!(!out.errors.is_empty());
            assert!(!out.fatal);
        }

        let out = run(&corrupt_frame(&[1u8; 8]), &mut cursor);
        assert!(out.fatal);
        assert_eq!(cursor.resync_failures, 3);
    }

    #[test]
    fn zero_length_body_is_valid() {
        let mut cursor = Cursor::default();
        let wire = frame::encode(&[]).expect("encode");
        let out = run(&wire, &mut cursor);
        assert_eq!(out.deliveries, vec![Vec::<u8>::new()]);
        assert!(cursor.is_clean());
    }

    #[test]
    fn footer_landing_in_next_read_is_not_corruption() {
        let body = vec![b'y'; 16];
        let wire = frame::encode(&body).expect("encode");
        let (first, second) = wire.split_at(HEADER_LEN + body.len());
        assert_eq!(second.len(), 1);

        let mut cursor = Cursor::default();
        let out1 = run(first, &mut cursor);
        assert!(out1.deliveries.is_empty());
        assert!(out1.needs_continuation);
        assert!(out1.errors.is_empty());

        let out2 = run(second, &mut cursor);
        assert_eq!(out2.deliveries, vec![body]);
        assert!(cursor.is_clean());
    }

    #[test]
    fn header_split_across_two_chunks() {
        let body = vec![9u8; 20];
        let wire = frame::encode(&body).expect("encode");
        let chunks = vec![chunk_of(&wire[..3]), chunk_of(&wire[3..])];
        let mut cursor = Cursor::default();
        let out = reassemble(&chunks, &mut cursor, 3);
        assert_eq!(out.deliveries, vec![body]);
    }

    #[test]
    fn header_split_across_two_reads() {
        let body = vec![7u8; 12];
        let wire = frame::encode(&body).expect("encode");
        let mut cursor = Cursor::default();

        let out1 = run(&wire[..3], &mut cursor);
        assert!(out1.deliveries.is_empty());
        assert!(out1.needs_continuation);
        assert_eq!(cursor.pending_header.len(), 3);

        let out2 = run(&wire[3..], &mut cursor);
        assert_eq!(out2.deliveries, vec![body]);
        assert!(cursor.is_clean());
    }
}
