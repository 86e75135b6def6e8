// ring.rs - SPSC byte ring with borrowable read views

use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Error returned by ring buffer operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// The write did not fit into the remaining free space.
    #[error("ring buffer full: requested {requested} bytes, {free} free")]
    BufferFull {
        /// Bytes the caller attempted to write.
        requested: usize,
        /// Free bytes at the time of the call.
        free: usize,
    },
}

struct Shared {
    storage: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    // Monotonic cursors; position in storage is cursor & (capacity - 1).
    write: AtomicUsize,
    read: AtomicUsize,
}

// Safety: producer and consumer touch disjoint regions of `storage`. The
// producer only writes between `write` and `read + capacity`; the consumer
// only reads between `read` and `write`. Cursor updates publish with
// release ordering and are observed with acquire ordering.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Creates a single-producer single-consumer byte ring.
///
/// `capacity` is rounded up to the next power of two so cursor arithmetic
/// stays branch-free across wrap-around.
pub fn spsc(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring capacity must be > 0");
    let capacity = capacity.next_power_of_two();
    let shared = Arc::new(Shared {
        storage: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
        capacity,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer {
            shared,
            outstanding: Cell::new(0),
        },
    )
}

/// Write end of a [`spsc`] ring.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Bytes that can be written without overwriting unread data.
    pub fn free(&self) -> usize {
        let w = self.shared.write.load(Ordering::Relaxed);
        let r = self.shared.read.load(Ordering::Acquire);
        self.shared.capacity - (w - r)
    }

    /// Appends `data` to the ring. All-or-nothing: when the bytes do not
    /// fit the ring is left untouched and `BufferFull` is returned.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, RingError> {
        if data.is_empty() {
            return Ok(0);
        }
        let cap = self.shared.capacity;
        let w = self.shared.write.load(Ordering::Relaxed);
        let r = self.shared.read.load(Ordering::Acquire);
        let free = cap - (w - r);
        if data.len() > free {
            return Err(RingError::BufferFull {
                requested: data.len(),
                free,
            });
        }

        let idx = w & (cap - 1);
        let first = data.len().min(cap - idx);
        unsafe {
            let base = (*self.shared.storage.get()).as_mut_ptr();
            ptr::copy_nonoverlapping(data.as_ptr(), base.add(idx), first);
            if data.len() > first {
                ptr::copy_nonoverlapping(data.as_ptr().add(first), base, data.len() - first);
            }
        }
        self.shared.write.store(w + data.len(), Ordering::Release);
        Ok(data.len())
    }
}

/// Read end of a [`spsc`] ring.
pub struct RingConsumer {
    shared: Arc<Shared>,
    outstanding: Cell<usize>,
}

impl RingConsumer {
    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Bytes available for reading.
    pub fn available(&self) -> usize {
        let r = self.shared.read.load(Ordering::Relaxed);
        let w = self.shared.write.load(Ordering::Acquire);
        w - r
    }

    /// Borrows up to `max` readable bytes without consuming them.
    ///
    /// The view covers at most two contiguous segments when the data wraps.
    /// The producer will not touch the viewed region until [`commit`] moves
    /// the read cursor past it.
    ///
    /// [`commit`]: RingConsumer::commit
    pub fn peek(&self, max: usize) -> RingView<'_> {
        let cap = self.shared.capacity;
        let r = self.shared.read.load(Ordering::Relaxed);
        let w = self.shared.write.load(Ordering::Acquire);
        let n = max.min(w - r);
        self.outstanding.set(n);
        if n == 0 {
            return RingView {
                first: &[],
                second: &[],
            };
        }
        let idx = r & (cap - 1);
        let first_len = n.min(cap - idx);
        unsafe {
            let base = (*self.shared.storage.get()).as_ptr();
            RingView {
                first: std::slice::from_raw_parts(base.add(idx), first_len),
                second: std::slice::from_raw_parts(base, n - first_len),
            }
        }
    }

    /// Copies up to `out.len()` readable bytes into `out` without
    /// consuming them, returning the number copied. Linearises a wrapped
    /// region for callers that need one contiguous slice.
    pub fn peek_into(&self, out: &mut [u8]) -> usize {
        let view = self.peek(out.len());
        view.copy_to(out)
    }

    /// Consumes `n` bytes, releasing them back to the producer.
    ///
    /// `n` must not exceed the length of the most recent peek; violating
    /// that is a programming error caught by a debug assertion.
    pub fn commit(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let r = self.shared.read.load(Ordering::Relaxed);
        let w = self.shared.write.load(Ordering::Acquire);
        debug_assert!(n <= w - r, "commit past readable region: {n} > {}", w - r);
        debug_assert!(
            n <= self.outstanding.get(),
            "commit past outstanding peek: {n} > {}",
            self.outstanding.get()
        );
        self.outstanding.set(self.outstanding.get().saturating_sub(n));
        self.shared.read.store(r + n, Ordering::Release);
    }

    /// Discards all unread bytes.
    pub fn reset(&mut self) {
        let w = self.shared.write.load(Ordering::Acquire);
        self.outstanding.set(0);
        self.shared.read.store(w, Ordering::Release);
    }
}

/// Borrowed view over readable ring bytes, in at most two segments.
#[derive(Debug, Clone, Copy)]
pub struct RingView<'a> {
    first: &'a [u8],
    second: &'a [u8],
}

impl<'a> RingView<'a> {
    /// Total viewed length.
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// True when the view holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// The underlying segments in logical order.
    pub fn segments(&self) -> (&'a [u8], &'a [u8]) {
        (self.first, self.second)
    }

    /// Returns the single contiguous slice when the view does not wrap.
    pub fn contiguous(&self) -> Option<&'a [u8]> {
        if self.second.is_empty() {
            Some(self.first)
        } else {
            None
        }
    }

    /// Copies up to `out.len()` bytes into `out`, returning the count.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        self.copy_range(0, out)
    }

    /// Copies up to `out.len()` bytes starting at `offset` into `out`,
    /// returning the count.
    pub fn copy_range(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.len() {
            return 0;
        }
        let mut copied = 0;
        if offset < self.first.len() {
            let src = &self.first[offset..];
            let a = src.len().min(out.len());
            out[..a].copy_from_slice(&src[..a]);
            copied = a;
        }
        let second_off = offset.saturating_sub(self.first.len());
        if copied < out.len() && second_off < self.second.len() {
            let src = &self.second[second_off..];
            let b = src.len().min(out.len() - copied);
            out[copied..copied + b].copy_from_slice(&src[..b]);
            copied += b;
        }
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_roundtrip() {
        let (mut tx, mut rx) = spsc(16);
        tx.write(&[1, 2, 3, 4]).unwrap();
        let view = rx.peek(16);
        assert_eq!(view.len(), 4);
        let mut out = [0u8; 4];
        view.copy_to(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        rx.commit(4);
        assert_eq!(rx.available(), 0);
    }

    #[test]
    fn write_full_returns_buffer_full() {
        let (mut tx, mut rx) = spsc(8);
        tx.write(&[0u8; 8]).unwrap();
        let err = tx.write(&[1]).unwrap_err();
        assert_eq!(
            err,
            RingError::BufferFull {
                requested: 1,
                free: 0
            }
        );
        // Freeing k bytes admits a write of <= k bytes.
        rx.peek(3);
        rx.commit(3);
        assert_eq!(tx.free(), 3);
        tx.write(&[9, 9, 9]).unwrap();
        assert!(tx.write(&[1]).is_err());
    }

    #[test]
    fn wrapped_view_has_two_segments() {
        let (mut tx, mut rx) = spsc(8);
        tx.write(&[0u8; 6]).unwrap();
        rx.peek(6);
        rx.commit(6);
        // Next write straddles the wrap point.
        tx.write(&[10, 11, 12, 13]).unwrap();
        let view = rx.peek(4);
        let (a, b) = view.segments();
        assert_eq!(a, &[10, 11]);
        assert_eq!(b, &[12, 13]);
        assert!(view.contiguous().is_none());
        let mut flat = [0u8; 4];
        assert_eq!(view.copy_to(&mut flat), 4);
        assert_eq!(flat, [10, 11, 12, 13]);
    }

    #[test]
    fn frame_straddling_wrap_parses_after_linearisation() {
        let select_aid: &[u8] = &[
            0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10, 0x00,
        ];
        let (mut tx, mut rx) = spsc(16);
        // Push the read cursor forward so the next frame wraps.
        tx.write(&[0u8; 12]).unwrap();
        rx.peek(12);
        rx.commit(12);

        tx.write(select_aid).unwrap();
        let view = rx.peek(16);
        assert!(view.contiguous().is_none());
        let mut flat = [0u8; 13];
        assert_eq!(view.copy_to(&mut flat), 13);
        let frame = crate::apdu::parse_command(&flat).unwrap();
        assert_eq!(frame.ins, crate::apdu::ins::SELECT);
        assert_eq!(frame.lc, Some(7));
        rx.commit(13);
        assert_eq!(rx.available(), 0);
    }

    #[test]
    fn commit_shrinks_available_exactly() {
        let (mut tx, mut rx) = spsc(32);
        tx.write(&[7u8; 20]).unwrap();
        let before = rx.available();
        let n = rx.peek(5).len();
        rx.commit(n);
        assert_eq!(rx.available(), before - n);
    }

    #[test]
    fn reset_discards_unread() {
        let (mut tx, mut rx) = spsc(16);
        tx.write(&[1u8; 10]).unwrap();
        rx.reset();
        assert_eq!(rx.available(), 0);
        assert_eq!(tx.free(), 16);
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let (tx, _rx) = spsc(100);
        assert_eq!(tx.capacity(), 128);
    }

    #[test]
    fn cross_thread_fifo_order() {
        let (mut tx, mut rx) = spsc(64);
        let writer = std::thread::spawn(move || {
            for chunk in 0u8..100 {
                loop {
                    match tx.write(&[chunk; 3]) {
                        Ok(_) => break,
                        Err(RingError::BufferFull { .. }) => std::thread::yield_now(),
                    }
                }
            }
        });

        let mut seen = Vec::with_capacity(300);
        while seen.len() < 300 {
            let view = rx.peek(64);
            let n = view.len();
            if n == 0 {
                std::thread::yield_now();
                continue;
            }
            let mut buf = vec![0u8; n];
            view.copy_to(&mut buf);
            seen.extend_from_slice(&buf);
            rx.commit(n);
        }
        writer.join().unwrap();

        for (i, chunk) in seen.chunks(3).enumerate() {
            assert_eq!(chunk, &[i as u8; 3]);
        }
    }
}
