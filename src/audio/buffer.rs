//! Byte ring buffers for audio frames
//!
//! [`ByteRing`] is the unsynchronized core used directly where a single thread
//! owns the buffer (the jitter buffer). [`FrameRingBuffer`] wraps it in a
//! short-held mutex plus condition variables so one producer and one consumer
//! on different threads can share it. Hot-path callers use the `try_*_for`
//! variants, which give up after a bounded lock wait instead of blocking.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed-capacity circular byte buffer.
///
/// Storage is allocated once in [`ByteRing::new`] and never grows.
pub struct ByteRing {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
}

impl ByteRing {
    /// Create a ring holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Ring capacity must be non-zero");

        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently buffered and readable
    pub fn available(&self) -> usize {
        self.len
    }

    /// Bytes that can be written without discarding anything
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Best-effort write. Returns the number of bytes accepted, which is short
    /// when the ring fills up.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        self.push_unchecked(&data[..n]);
        n
    }

    /// Write all of `data` or nothing at all.
    pub fn write_exact(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free() {
            return false;
        }
        self.push_unchecked(data);
        true
    }

    /// Write all of `data`, discarding the oldest unread bytes to make room.
    ///
    /// Always reports `data.len()` as written. When `data` is larger than the
    /// ring only its most recent `capacity` bytes are retained.
    pub fn write_overwrite(&mut self, data: &[u8]) -> usize {
        let cap = self.capacity();
        let tail = if data.len() > cap {
            &data[data.len() - cap..]
        } else {
            data
        };

        let overflow = (self.len + tail.len()).saturating_sub(cap);
        self.discard(overflow);
        self.push_unchecked(tail);

        data.len()
    }

    /// Read up to `buf.len()` bytes in FIFO order
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len);
        let cap = self.capacity();

        let first = n.min(cap - self.read_pos);
        buf[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        buf[first..n].copy_from_slice(&self.data[..n - first]);

        self.read_pos = (self.read_pos + n) % cap;
        self.len -= n;
        n
    }

    /// Drop up to `n` of the oldest bytes. Returns how many were dropped.
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.len -= n;
        n
    }

    /// Clear both cursors, discarding buffered content
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
    }

    fn push_unchecked(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.free());
        let n = data.len();
        let cap = self.capacity();

        let first = n.min(cap - self.write_pos);
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        self.data[..n - first].copy_from_slice(&data[first..]);

        self.write_pos = (self.write_pos + n) % cap;
        self.len += n;
    }
}

impl std::fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteRing")
            .field("capacity", &self.capacity())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .field("available", &self.len)
            .finish()
    }
}

/// Outcome of a guarded hot-path write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole frame was committed
    Committed,
    /// Not enough free space; nothing was written
    Full,
    /// The lock could not be acquired in time; nothing was written
    Contended,
    /// The guard rejected the write (e.g. session epoch changed)
    Stale,
}

/// Mutex-protected ring buffer shared between one producer and one consumer.
pub struct FrameRingBuffer {
    ring: Mutex<ByteRing>,
    data_ready: Condvar,
    space_ready: Condvar,
    capacity: usize,
}

impl FrameRingBuffer {
    /// Create a new ring buffer with the specified capacity in bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(ByteRing::new(capacity)),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.ring.lock().available()
    }

    pub fn free(&self) -> usize {
        self.ring.lock().free()
    }

    /// Best-effort write; never waits for space
    pub fn write(&self, data: &[u8]) -> usize {
        let written = self.ring.lock().write(data);
        if written > 0 {
            self.data_ready.notify_one();
        }
        written
    }

    /// Write everything, discarding the oldest bytes if needed
    pub fn write_overwrite(&self, data: &[u8]) -> usize {
        let written = self.ring.lock().write_overwrite(data);
        if written > 0 {
            self.data_ready.notify_one();
        }
        written
    }

    /// Wait up to `timeout` for enough space to hold `data`, then write
    /// best-effort. Used by paced hardware writers, never by the pipeline.
    pub fn write_timeout(&self, data: &[u8], timeout: Duration) -> usize {
        let mut ring = self.ring.lock();
        let wanted = data.len().min(ring.capacity());

        if ring.free() < wanted && !timeout.is_zero() {
            let deadline = Instant::now() + timeout;
            while ring.free() < wanted {
                if self.space_ready.wait_until(&mut ring, deadline).timed_out() {
                    break;
                }
            }
        }

        let written = ring.write(data);
        drop(ring);
        if written > 0 {
            self.data_ready.notify_one();
        }
        written
    }

    /// Read up to `buf.len()` bytes. When the buffer is empty, wait at most
    /// `timeout` for data to arrive; returns 0 if none does.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let mut ring = self.ring.lock();

        if ring.is_empty() && !timeout.is_zero() {
            let deadline = Instant::now() + timeout;
            while ring.is_empty() {
                if self.data_ready.wait_until(&mut ring, deadline).timed_out() {
                    break;
                }
            }
        }

        let read = ring.read(buf);
        drop(ring);
        if read > 0 {
            self.space_ready.notify_one();
        }
        read
    }

    /// Commit `data` whole, with the lock acquired within `lock_timeout`.
    ///
    /// `guard` runs while the lock is held, right before the commit; returning
    /// `false` discards the write and leaves the buffer untouched.
    pub fn try_write_exact_for<G>(&self, data: &[u8], lock_timeout: Duration, guard: G) -> WriteOutcome
    where
        G: FnOnce() -> bool,
    {
        let Some(mut ring) = self.ring.try_lock_for(lock_timeout) else {
            return WriteOutcome::Contended;
        };

        if !guard() {
            return WriteOutcome::Stale;
        }

        if !ring.write_exact(data) {
            return WriteOutcome::Full;
        }

        drop(ring);
        self.data_ready.notify_one();
        WriteOutcome::Committed
    }

    /// Best-effort write with the lock acquired within `lock_timeout`.
    /// Returns `None` when the lock was contended, else the bytes accepted.
    pub fn try_write_for(&self, data: &[u8], lock_timeout: Duration) -> Option<usize> {
        let written = self.ring.try_lock_for(lock_timeout)?.write(data);
        if written > 0 {
            self.data_ready.notify_one();
        }
        Some(written)
    }

    /// Overwrite-mode write with the lock acquired within `lock_timeout`.
    /// Returns `None` when the lock was contended, else whether older unread
    /// bytes had to be discarded.
    pub fn try_write_overwrite_for(&self, data: &[u8], lock_timeout: Duration) -> Option<bool> {
        let mut ring = self.ring.try_lock_for(lock_timeout)?;
        let overflowed = data.len() > ring.free();
        ring.write_overwrite(data);
        drop(ring);
        self.data_ready.notify_one();
        Some(overflowed)
    }

    /// Read up to `buf.len()` bytes without waiting for data, with the lock
    /// acquired within `lock_timeout`. Returns 0 when contended or empty.
    pub fn try_read_for(&self, buf: &mut [u8], lock_timeout: Duration) -> usize {
        let Some(mut ring) = self.ring.try_lock_for(lock_timeout) else {
            return 0;
        };
        let read = ring.read(buf);
        drop(ring);
        if read > 0 {
            self.space_ready.notify_one();
        }
        read
    }

    /// Read exactly `buf.len()` bytes if that many are available and the lock
    /// is acquired within `lock_timeout`. Otherwise nothing is consumed.
    pub fn try_read_exact_for(&self, buf: &mut [u8], lock_timeout: Duration) -> bool {
        let Some(mut ring) = self.ring.try_lock_for(lock_timeout) else {
            return false;
        };

        if ring.available() < buf.len() {
            return false;
        }

        ring.read(buf);
        drop(ring);
        self.space_ready.notify_one();
        true
    }

    /// Run `f` against the locked ring, giving up after `lock_timeout`
    pub fn with_ring_for<R>(&self, lock_timeout: Duration, f: impl FnOnce(&mut ByteRing) -> R) -> Option<R> {
        let mut ring = self.ring.try_lock_for(lock_timeout)?;
        let result = f(&mut ring);
        drop(ring);
        self.data_ready.notify_one();
        self.space_ready.notify_one();
        Some(result)
    }

    /// Discard all buffered content
    pub fn reset(&self) {
        self.ring.lock().reset();
        self.space_ready.notify_all();
    }
}

impl std::fmt::Debug for FrameRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRingBuffer")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<FrameRingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(FrameRingBuffer::new(capacity))
}

/// Jitter buffer for received network audio.
///
/// Playback is withheld until `prebuffer` bytes have accumulated; after that
/// frames are released one at a time for as long as a whole frame is
/// buffered. The gate only closes again on [`JitterBuffer::reset`].
pub struct JitterBuffer {
    ring: ByteRing,
    prebuffer: usize,
    primed: bool,
}

impl JitterBuffer {
    /// Create a new jitter buffer
    pub fn new(capacity: usize, prebuffer: usize) -> Self {
        Self {
            ring: ByteRing::new(capacity),
            prebuffer: prebuffer.min(capacity),
            primed: false,
        }
    }

    /// Append received bytes. Short count means the buffer overflowed.
    pub fn push(&mut self, data: &[u8]) -> usize {
        self.ring.write(data)
    }

    /// Fill `frame` with the next frame if the gate is open and a whole frame
    /// is buffered.
    pub fn pop_frame(&mut self, frame: &mut [u8]) -> bool {
        if !self.primed {
            if self.ring.available() < self.prebuffer {
                return false;
            }
            self.primed = true;
        }

        if self.ring.available() < frame.len() {
            return false;
        }

        self.ring.read(frame) == frame.len()
    }

    /// Whether the prebuffer threshold has been reached this session
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn available(&self) -> usize {
        self.ring.available()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn prebuffer(&self) -> usize {
        self.prebuffer
    }

    /// Drop buffered audio and close the prebuffer gate
    pub fn reset(&mut self) {
        self.ring.reset();
        self.primed = false;
    }
}
