//! The multi-segment I/O buffer ("netbuf"): a chain of segments with
//! independent read/write cursors, used for zero-copy send/splice by both
//! network I/O and protocol state.
//!
//! A segment is one of three kinds:
//! - [`Segment::Internal`]: heap-allocated storage the buffer itself owns
//!   and can grow into via `demand`.
//! - [`Segment::External`]: data owned elsewhere, referenced for as long as
//!   the segment lives; a release callback runs exactly once, when the
//!   buffer finishes consuming it (or drops it unconsumed).
//! - [`Segment::Embedded`]: a small inline byte array for tiny writes that
//!   don't justify a heap allocation (`embed`).
//!
//! A chunk holding several packed segments collapses to one segment per
//! chunk here, which is the common case in practice and keeps the Rust
//! model straightforward; see `DESIGN.md`.
use std::collections::VecDeque;

/// Minimum size of a freshly allocated internal segment.
const MIN_SEGMENT: usize = 512;
/// Internal segments never grow past this in one `demand` call.
const MAX_SEGMENT: usize = 64 * 1024;
/// Splices smaller than this degrade to copy-then-release instead of
/// holding an external segment.
const SPLICE_COPY_THRESHOLD: usize = 128;
/// Inline capacity for `embed`-ded segments.
const EMBED_CAPACITY: usize = 32;

struct InternalSegment {
    data: Box<[u8]>,
    used: usize,
    consumed: usize,
}

impl InternalSegment {
    fn new(capacity: usize) -> Self {
        InternalSegment {
            data: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
            consumed: 0,
        }
    }

    fn area(&self) -> usize {
        self.data.len()
    }

    fn free(&self) -> usize {
        self.area() - self.used
    }

    fn readable(&self) -> &[u8] {
        &self.data[self.consumed..self.used]
    }

    fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    fn is_fully_consumed(&self) -> bool {
        self.consumed == self.used
    }

    fn is_fully_reusable(&self) -> bool {
        self.is_fully_consumed() && self.used == self.area()
    }
}

struct ExternalSegment {
    bytes: Box<dyn AsRef<[u8]>>,
    used: usize,
    consumed: usize,
    release: Option<Box<dyn FnOnce()>>,
}

impl ExternalSegment {
    fn readable(&self) -> &[u8] {
        &self.bytes.as_ref().as_ref()[self.consumed..self.used]
    }
}

impl Drop for ExternalSegment {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

struct EmbeddedSegment {
    data: [u8; EMBED_CAPACITY],
    used: usize,
    consumed: usize,
}

impl EmbeddedSegment {
    fn readable(&self) -> &[u8] {
        &self.data[self.consumed..self.used]
    }

    fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }
}

enum Segment {
    Internal(InternalSegment),
    External(ExternalSegment),
    Embedded(EmbeddedSegment),
}

impl Segment {
    fn readable(&self) -> &[u8] {
        match self {
            Segment::Internal(s) => s.readable(),
            Segment::External(s) => s.readable(),
            Segment::Embedded(s) => s.readable(),
        }
    }

    fn remaining(&self) -> usize {
        self.readable().len()
    }

    /// The unwritten tail of this segment's storage, or an empty slice for
    /// an [`Segment::External`] segment (data owned elsewhere, never
    /// written into through the buffer).
    fn writable(&mut self) -> &mut [u8] {
        match self {
            Segment::Internal(s) => s.writable(),
            Segment::External(_) => &mut [],
            Segment::Embedded(s) => s.writable(),
        }
    }

    fn advance_consumed(&mut self, n: usize) {
        match self {
            Segment::Internal(s) => s.consumed += n,
            Segment::External(s) => s.consumed += n,
            Segment::Embedded(s) => s.consumed += n,
        }
    }

    fn is_fully_consumed(&self) -> bool {
        self.remaining() == 0
    }
}

/// A chained, thread-owned byte buffer. Not `Sync`: a buffer is created
/// and used by exactly one thread.
#[derive(Default)]
pub struct Buffer {
    segments: VecDeque<Segment>,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            segments: VecDeque::new(),
        }
    }

    /// Total unread bytes across every segment.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::remaining).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ensures the write side (the tail segment) has at least `n` free
    /// bytes, allocating a new internal segment sized
    /// `max(previous_size, n, MIN_SEGMENT)` (capped at `MAX_SEGMENT`,
    /// growing across multiple segments if `n` alone exceeds the cap) if
    /// necessary.
    pub fn demand(&mut self, n: usize) {
        if let Some(Segment::Internal(tail)) = self.segments.back() {
            if tail.free() >= n {
                return;
            }
        }
        let previous = match self.segments.back() {
            Some(Segment::Internal(s)) => s.area(),
            _ => 0,
        };
        // Grows geometrically from the previous segment's size, floored at
        // MIN_SEGMENT and capped at MAX_SEGMENT -- except when `n` itself
        // exceeds the cap, in which case a single oversized segment is
        // allocated so `write`'s caller-side loop always makes progress.
        let size = previous.max(n).max(MIN_SEGMENT);
        let size = if n > MAX_SEGMENT { n } else { size.min(MAX_SEGMENT) };
        self.segments.push_back(Segment::Internal(InternalSegment::new(size)));
    }

    /// Advances the write cursor of the tail internal segment by `n`
    /// bytes, after the caller has written directly into the space
    /// `demand` reserved.
    pub fn fill(&mut self, n: usize) {
        if let Some(Segment::Internal(tail)) = self.segments.back_mut() {
            tail.used = (tail.used + n).min(tail.area());
        }
    }

    /// Advances the read cursor by `n` bytes across as many segments as
    /// needed, dropping (and, for external segments, releasing) any
    /// segment fully consumed in the process.
    pub fn flush(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.segments.front_mut() else { break };
            let remaining = front.remaining();
            let take = remaining.min(n);
            front.advance_consumed(take);
            n -= take;
            if front.is_fully_consumed() {
                self.segments.pop_front();
            } else {
                break;
            }
        }
    }

    /// Copies `data` into the buffer, growing it as needed.
    pub fn write(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            self.demand(data.len() - offset);
            let Some(Segment::Internal(tail)) = self.segments.back_mut() else {
                unreachable!("demand always leaves an internal segment at the tail")
            };
            let space = tail.free();
            let take = space.min(data.len() - offset);
            tail.data[tail.used..tail.used + take].copy_from_slice(&data[offset..offset + take]);
            tail.used += take;
            offset += take;
        }
    }

    /// Copies up to `out.len()` unread bytes into `out`, advancing the
    /// read cursor by the number of bytes copied. Returns the number of
    /// bytes actually read (less than `out.len()` if the buffer held
    /// fewer unread bytes).
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            let Some(front) = self.segments.front_mut() else { break };
            let readable = front.readable();
            let take = readable.len().min(out.len() - copied);
            if take == 0 {
                break;
            }
            out[copied..copied + take].copy_from_slice(&readable[..take]);
            front.advance_consumed(take);
            copied += take;
            if front.is_fully_consumed() {
                self.segments.pop_front();
            }
        }
        copied
    }

    /// Writes formatted text into the buffer. `printf` and `vprintf` collapse
    /// into this one entry point since Rust's `format_args!` already does the
    /// vararg capture `vprintf` exists for in C.
    pub fn printf(&mut self, args: std::fmt::Arguments<'_>) {
        let rendered = format!("{args}");
        self.write(rendered.as_bytes());
    }

    /// Inserts an external segment backed by `bytes` (already containing
    /// `used` valid bytes out of `bytes.as_ref().len()` total), calling
    /// `release` exactly once when the buffer finishes consuming it (or
    /// drops it early). Splices under `SPLICE_COPY_THRESHOLD` bytes are
    /// copied into the buffer immediately instead, with `release` called
    /// right away.
    pub fn splice(
        &mut self,
        bytes: impl AsRef<[u8]> + 'static,
        used: usize,
        release: impl FnOnce() + 'static,
    ) {
        if used < SPLICE_COPY_THRESHOLD {
            self.write(&bytes.as_ref()[..used]);
            release();
            return;
        }
        self.segments.push_back(Segment::External(ExternalSegment {
            bytes: Box::new(bytes),
            used,
            consumed: 0,
            release: Some(Box::new(release)),
        }));
    }

    /// Appends a small inline segment of up to `EMBED_CAPACITY` bytes,
    /// avoiding a heap allocation for tiny writes. Returns a writer handle
    /// the caller fills directly.
    pub fn embed(&mut self, size: usize) -> EmbedWriter<'_> {
        assert!(size <= EMBED_CAPACITY, "embedded segment too large");
        self.segments.push_back(Segment::Embedded(EmbeddedSegment {
            data: [0u8; EMBED_CAPACITY],
            used: 0,
            consumed: 0,
        }));
        EmbedWriter {
            segment: self.segments.back_mut().expect("just pushed"),
            capacity: size,
        }
    }

    /// Consumes everything up to the current read position, merging fully
    /// consumed internal segments at the front so their space can be
    /// reused, and dropping any fully consumed external/embedded segments.
    /// Already-consumed internal segments that are also fully written
    /// (`is_fully_reusable`) are reset to empty rather than freed, to
    /// avoid an allocation on the next `demand`.
    pub fn rectify(&mut self) {
        while let Some(front) = self.segments.front_mut() {
            match front {
                Segment::Internal(s) if s.is_fully_consumed() => {
                    if s.is_fully_reusable() && self.segments.len() == 1 {
                        s.used = 0;
                        s.consumed = 0;
                        break;
                    }
                    self.segments.pop_front();
                }
                Segment::External(s) if s.readable().is_empty() => {
                    self.segments.pop_front();
                }
                Segment::Embedded(s) if s.readable().is_empty() => {
                    self.segments.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Iterates unread slices, one per remaining segment, in read order.
    pub fn read_iter(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(Segment::readable)
    }

    /// Iterates the unwritten tail space of every segment, in the same
    /// order as `read_iter`, for a caller that wants to write directly
    /// into reserved capacity (e.g. a `readv`/`writev`-style syscall)
    /// rather than going through [`Buffer::write`]. External segments
    /// yield an empty slice since their storage isn't owned by the
    /// buffer. `demand` must be called first to reserve space; `fill`
    /// afterwards to record how much of it was actually written.
    pub fn write_iter(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.segments.iter_mut().map(Segment::writable)
    }
}

pub struct EmbedWriter<'a> {
    segment: &'a mut Segment,
    capacity: usize,
}

impl<'a> EmbedWriter<'a> {
    pub fn write(&mut self, data: &[u8]) {
        let Segment::Embedded(s) = self.segment else {
            unreachable!("EmbedWriter always wraps an Embedded segment")
        };
        let take = data.len().min(self.capacity - s.used);
        s.data[s.used..s.used + take].copy_from_slice(&data[..take]);
        s.used += take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = Buffer::new();
        buf.write(b"hello ");
        buf.write(b"world");
        let mut out = vec![0u8; 11];
        let n = buf.read(&mut out);
        assert_eq!(n, 11);
        assert_eq!(&out, b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn write_larger_than_one_segment_still_round_trips() {
        let mut buf = Buffer::new();
        let payload: Vec<u8> = (0u8..=255).cycle().take(5000).collect();
        buf.write(&payload);
        let mut out = vec![0u8; payload.len()];
        let n = buf.read(&mut out);
        assert_eq!(n, payload.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn splice_and_release_called_exactly_once_after_consumption() {
        // S6: write 5000 bytes across three writes, splice a 4096-byte
        // external region, read all 9096 bytes back and assert the
        // release callback fired exactly once.
        let mut buf = Buffer::new();
        buf.write(&vec![1u8; 2000]);
        buf.write(&vec![2u8; 2000]);
        buf.write(&vec![3u8; 1000]);

        let released = Rc::new(Cell::new(0u32));
        let released2 = Rc::clone(&released);
        let external = vec![9u8; 4096];
        buf.splice(external, 4096, move || released2.set(released2.get() + 1));

        assert_eq!(released.get(), 0, "release must not fire before consumption");

        let mut out = vec![0u8; 9096];
        let n = buf.read(&mut out);
        assert_eq!(n, 9096);
        assert_eq!(&out[..2000], &vec![1u8; 2000][..]);
        assert_eq!(&out[2000..4000], &vec![2u8; 2000][..]);
        assert_eq!(&out[4000..5000], &vec![3u8; 1000][..]);
        assert_eq!(&out[5000..], &vec![9u8; 4096][..]);
        assert_eq!(released.get(), 1, "release must fire exactly once");
    }

    #[test]
    fn short_splice_degrades_to_copy_then_release_immediately() {
        let mut buf = Buffer::new();
        let released = Rc::new(Cell::new(false));
        let released2 = Rc::clone(&released);
        buf.splice(vec![7u8; 10], 10, move || released2.set(true));
        assert!(released.get(), "short splices release immediately");
        let mut out = vec![0u8; 10];
        assert_eq!(buf.read(&mut out), 10);
        assert_eq!(out, vec![7u8; 10]);
    }

    #[test]
    fn drop_without_consuming_still_releases_external_segment() {
        let released = Rc::new(Cell::new(false));
        let released2 = Rc::clone(&released);
        {
            let mut buf = Buffer::new();
            buf.splice(vec![1u8; 4096], 4096, move || released2.set(true));
        }
        assert!(released.get());
    }

    #[test]
    fn rectify_reclaims_a_fully_consumed_single_segment() {
        let mut buf = Buffer::new();
        buf.write(b"abc");
        let mut out = [0u8; 3];
        buf.read(&mut out);
        buf.rectify();
        buf.write(b"xyz");
        let mut out2 = [0u8; 3];
        assert_eq!(buf.read(&mut out2), 3);
        assert_eq!(&out2, b"xyz");
    }

    #[test]
    fn embed_stores_small_inline_writes() {
        let mut buf = Buffer::new();
        buf.embed(5).write(b"hi");
        let mut out = [0u8; 2];
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(&out, b"hi");
    }

    #[test]
    fn read_iter_yields_one_slice_per_segment() {
        let mut buf = Buffer::new();
        buf.write(b"abc");
        buf.splice(vec![0u8; 200], 200, || {});
        let slices: Vec<&[u8]> = buf.read_iter().collect();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0], b"abc");
        assert_eq!(slices[1].len(), 200);
    }

    #[test]
    fn write_iter_exposes_reserved_capacity_to_write_into_directly() {
        let mut buf = Buffer::new();
        buf.demand(16);
        {
            let mut slices = buf.write_iter();
            let tail = slices.next().expect("one internal segment");
            assert!(tail.len() >= 16);
            tail[..5].copy_from_slice(b"hello");
        }
        buf.fill(5);
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn write_iter_yields_empty_slice_for_external_segments() {
        let mut buf = Buffer::new();
        buf.splice(vec![1u8; 200], 200, || {});
        buf.demand(16);
        let slices: Vec<&mut [u8]> = buf.write_iter().collect();
        assert_eq!(slices.len(), 2);
        assert!(slices[0].is_empty());
        assert!(!slices[1].is_empty());
    }
}
