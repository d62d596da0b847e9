use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::trace;

use super::file::BufferCallback;

/// Pooled buffers are dropped after this long without any pool activity.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reusable write buffers. Every buffer handed out has at least
/// `buffer_size` bytes of capacity; larger requests are served with
/// one-off allocations that are not pooled.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_pooled: usize,
    idle_timeout: Duration,
    pool: SegQueue<BytesMut>,
    pooled: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self::with_idle_timeout(buffer_size, max_pooled, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(buffer_size: usize, max_pooled: usize, idle_timeout: Duration) -> Self {
        Self {
            buffer_size,
            max_pooled,
            idle_timeout,
            pool: SegQueue::new(),
            pooled: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn pooled(&self) -> usize {
        self.pooled.load(Ordering::Relaxed)
    }

    /// Returns an empty buffer with capacity for at least `size` bytes.
    pub fn get(&self, size: usize) -> BytesMut {
        self.touch();
        if size > self.buffer_size {
            return BytesMut::with_capacity(size);
        }
        match self.pool.pop() {
            Some(mut buffer) => {
                self.pooled.fetch_sub(1, Ordering::Relaxed);
                buffer.clear();
                buffer
            }
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    pub fn release(&self, mut buffer: BytesMut) {
        self.touch();
        if buffer.capacity() < self.buffer_size || self.pooled() >= self.max_pooled {
            return;
        }
        buffer.clear();
        self.pool.push(buffer);
        self.pooled.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops every pooled buffer.
    pub fn clear(&self) {
        let mut dropped = 0usize;
        while self.pool.pop().is_some() {
            self.pooled.fetch_sub(1, Ordering::Relaxed);
            dropped += 1;
        }
        if dropped > 0 {
            trace!(target: "relaymq::journal", dropped, "buffer pool cleared");
        }
    }

    /// Clears the pool when it has been idle for longer than the idle timeout.
    pub fn clear_if_idle(&self) -> bool {
        let idle = self.last_used.lock().elapsed() >= self.idle_timeout;
        if idle {
            self.clear();
        }
        idle
    }

    fn touch(&self) {
        let mut last = self.last_used.lock();
        if last.elapsed() >= self.idle_timeout {
            // Coming back from an idle period: whatever sat in the pool is stale.
            while self.pool.pop().is_some() {
                self.pooled.fetch_sub(1, Ordering::Relaxed);
            }
        }
        *last = Instant::now();
    }
}

impl BufferCallback for BufferPool {
    fn buffer_done(&self, buffer: BytesMut) {
        self.release(buffer);
    }
}
