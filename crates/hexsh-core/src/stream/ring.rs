//! Lock-free SPSC byte ring for drained channel data.
//!
//! One drainer thread produces, the application side consumes. The
//! read and write indices live on separate cache lines; adjacent
//! placement costs an order of magnitude under contention. One slot is
//! reserved so a full buffer is distinguishable from an empty one
//! without a separate count atomic.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default per-channel ring capacity. Output channels can carry bulky
/// data; the drain model only holds what the consumer has not read yet.
pub const DEFAULT_RING_CAPACITY: usize = 1024 * 1024;

/// A cursor on its own cache line.
#[repr(align(64))]
struct Cursor(AtomicUsize);

/// Single-producer single-consumer byte queue.
///
/// `write` is called by exactly one producer thread and `read`/`peek`
/// by exactly one consumer thread; concurrent calls to the same side
/// from distinct threads are not supported. All operations are total:
/// a full buffer accepts zero bytes rather than failing.
pub struct RingBuffer {
    storage: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    read_pos: Cursor,
    write_pos: Cursor,
}

// The cursors serialize access to each byte: a byte is written before
// the write index advances past it (release) and only read after the
// consumer observes that advance (acquire).
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring with storage for `capacity` bytes. One slot is
    /// reserved, so at most `capacity - 1` bytes are readable at once.
    pub fn new(capacity: usize) -> RingBuffer {
        assert!(capacity >= 2, "ring capacity must be at least 2");
        let storage = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        RingBuffer {
            storage,
            capacity,
            read_pos: Cursor(AtomicUsize::new(0)),
            write_pos: Cursor(AtomicUsize::new(0)),
        }
    }

    /// Bytes available for reading.
    pub fn available(&self) -> usize {
        let w = self.write_pos.0.load(Ordering::Acquire);
        let r = self.read_pos.0.load(Ordering::Acquire);
        if w >= r {
            w - r
        } else {
            self.capacity - r + w
        }
    }

    /// Bytes the producer can still write.
    pub fn free_space(&self) -> usize {
        self.capacity - self.available() - 1
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// True when the producer cannot accept another byte.
    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Copy as much of `data` as fits. Non-blocking; returns the byte
    /// count accepted (`0..=data.len()`).
    ///
    /// Producer side only.
    pub fn write(&self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.free_space());
        if to_write == 0 {
            return 0;
        }

        let wpos = self.write_pos.0.load(Ordering::Relaxed);
        let first = to_write.min(self.capacity - wpos);
        unsafe {
            self.copy_in(wpos, &data[..first]);
            if to_write > first {
                self.copy_in(0, &data[first..to_write]);
            }
        }

        self.write_pos
            .0
            .store((wpos + to_write) % self.capacity, Ordering::Release);
        to_write
    }

    /// Move up to `out.len()` buffered bytes into `out`, consuming
    /// them. Returns the byte count delivered.
    ///
    /// Consumer side only.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let to_read = out.len().min(self.available());
        if to_read == 0 {
            return 0;
        }

        let rpos = self.read_pos.0.load(Ordering::Relaxed);
        let first = to_read.min(self.capacity - rpos);
        unsafe {
            self.copy_out(rpos, &mut out[..first]);
            if to_read > first {
                self.copy_out(0, &mut out[first..to_read]);
            }
        }

        self.read_pos
            .0
            .store((rpos + to_read) % self.capacity, Ordering::Release);
        to_read
    }

    /// Like [`read`](Self::read) but leaves the bytes buffered.
    ///
    /// Consumer side only.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let to_peek = out.len().min(self.available());
        if to_peek == 0 {
            return 0;
        }

        let rpos = self.read_pos.0.load(Ordering::Relaxed);
        let first = to_peek.min(self.capacity - rpos);
        unsafe {
            self.copy_out(rpos, &mut out[..first]);
            if to_peek > first {
                self.copy_out(0, &mut out[first..to_peek]);
            }
        }
        to_peek
    }

    /// Discard all buffered bytes. Only valid while neither side is
    /// concurrently active.
    pub fn clear(&self) {
        self.read_pos.0.store(0, Ordering::Release);
        self.write_pos.0.store(0, Ordering::Release);
    }

    /// Wrap copies run as at most two contiguous block copies; the
    /// callers above guarantee `pos + src.len() <= capacity`.
    unsafe fn copy_in(&self, pos: usize, src: &[u8]) {
        let base = self.storage.as_ptr() as *mut u8;
        std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(pos), src.len());
    }

    unsafe fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        let base = self.storage.as_ptr() as *const u8;
        std::ptr::copy_nonoverlapping(base.add(pos), dst.as_mut_ptr(), dst.len());
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn write_then_read_round_trips() {
        let ring = RingBuffer::new(1024);
        assert_eq!(ring.write(b"Hello, hexsh!"), 13);
        assert_eq!(ring.available(), 13);

        let mut out = [0u8; 64];
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], b"Hello, hexsh!");
        assert_eq!(ring.available(), 0);
        assert!(ring.is_empty());
    }

    #[test]
    fn read_yields_prefix_of_written_data() {
        let ring = RingBuffer::new(16);
        let data = b"0123456789ABCDEF_EXTRA";
        let accepted = ring.write(data);
        assert_eq!(accepted, 15); // one slot reserved

        let mut out = [0u8; 32];
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], &data[..accepted]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn full_is_capacity_minus_one() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.write(&[0xAA; 16]), 7);
        assert!(ring.is_full());
        assert_eq!(ring.free_space(), 0);
        assert_eq!(ring.write(b"x"), 0);
    }

    #[test]
    fn wrap_around_preserves_order() {
        let ring = RingBuffer::new(8);
        let mut out = [0u8; 8];

        // Advance the cursors so the next write wraps.
        assert_eq!(ring.write(b"abcde"), 5);
        assert_eq!(ring.read(&mut out[..5]), 5);

        assert_eq!(ring.write(b"123456"), 6);
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], b"123456");
    }

    #[test]
    fn peek_does_not_consume() {
        let ring = RingBuffer::new(64);
        ring.write(b"telemetry");

        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        assert_eq!(ring.peek(&mut a), 9);
        assert_eq!(ring.read(&mut b), 9);
        assert_eq!(&a[..9], &b[..9]);
    }

    #[test]
    fn clear_resets_cursors() {
        let ring = RingBuffer::new(32);
        ring.write(b"leftovers");
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.free_space(), 31);
    }

    #[test]
    fn spsc_transfers_every_byte_in_order() {
        let ring = Arc::new(RingBuffer::new(256));
        let total: usize = 100_000;

        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut sent = 0usize;
                while sent < total {
                    let byte = [(sent % 251) as u8];
                    if ring.write(&byte) == 1 {
                        sent += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut received = 0usize;
        let mut buf = [0u8; 64];
        while received < total {
            let n = ring.read(&mut buf);
            for &b in &buf[..n] {
                assert_eq!(b, (received % 251) as u8);
                received += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
        assert!(ring.is_empty());
    }
}
