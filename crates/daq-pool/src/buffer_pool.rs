//! Bounded pool of sample buffers with `bytes::Bytes` integration.
//!
//! A [`BufferPool`] hands out [`PooledBuffer`]s for one channel's burst data.
//! Two limits apply to buffers that are currently out of the pool:
//!
//! - `max_buffers`: tracked with a semaphore permit per buffer
//! - `max_memory`: total bytes of sample data
//!
//! Allocation never blocks. When either limit would be exceeded,
//! [`BufferPool::try_allocate`] returns `None` and the producer decides how to
//! proceed (usually by dropping that channel's data for the burst).
//!
//! ## Memory Flow
//!
//! ```text
//! 1. try_allocate() reserves a permit + bytes, reuses a free Vec if possible
//! 2. Producer fills the buffer (as_mut_slice / write_samples)
//! 3. freeze() converts to Bytes (zero-copy, the Vec moves into the owner)
//! 4. Bytes is cloned into the last-delivered slot and to consumers
//! 5. When all clones are dropped, BufferOwner::drop() returns the Vec,
//!    the reserved bytes and the permit
//! ```
//!
//! Dropping a `PooledBuffer` without freezing it returns it the same way.

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::array::{Sample, SampleFormat};

/// Internal state for the buffer pool.
///
/// Wrapped in Arc for shared ownership between pool and buffer instances.
struct BufferPoolInner {
    /// Lock-free queue of returned allocations available for reuse
    free_buffers: SegQueue<Vec<u8>>,
    /// One permit per buffer that may be out of the pool
    semaphore: Semaphore,
    max_buffers: usize,
    max_memory: usize,
    /// Bytes of sample data currently out of the pool
    memory_in_use: AtomicUsize,
    /// Number of buffers that can still be allocated
    available: AtomicUsize,
    /// Metrics: total successful allocations
    total_acquires: AtomicU64,
    /// Metrics: total returns
    total_returns: AtomicU64,
    /// Metrics: allocations refused because a limit was reached
    total_refused: AtomicU64,
}

impl BufferPoolInner {
    fn give_back(&self, mut buffer: Vec<u8>, reserved: usize) {
        // Reset length but keep capacity
        buffer.clear();
        self.free_buffers.push(buffer);
        self.memory_in_use.fetch_sub(reserved, Ordering::AcqRel);
        self.available.fetch_add(1, Ordering::Relaxed);
        self.total_returns.fetch_add(1, Ordering::Relaxed);
        self.semaphore.add_permits(1);
    }
}

/// Pool of sample buffers bounded by count and total bytes.
///
/// Buffers are returned automatically when dropped. Thread-safe; clones share
/// the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    /// Create a pool allowing at most `max_buffers` buffers and `max_memory`
    /// bytes of sample data to be out at once.
    ///
    /// # Panics
    ///
    /// Panics if `max_buffers` is 0 or `max_memory` is 0.
    #[must_use]
    pub fn new(max_buffers: usize, max_memory: usize) -> Self {
        assert!(max_buffers > 0, "max_buffers must be > 0");
        assert!(max_memory > 0, "max_memory must be > 0");

        info!(
            max_buffers,
            max_memory_mb = max_memory as f64 / (1024.0 * 1024.0),
            "BufferPool created"
        );

        Self {
            inner: Arc::new(BufferPoolInner {
                free_buffers: SegQueue::new(),
                semaphore: Semaphore::new(max_buffers),
                max_buffers,
                max_memory,
                memory_in_use: AtomicUsize::new(0),
                available: AtomicUsize::new(max_buffers),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
                total_refused: AtomicU64::new(0),
            }),
        }
    }

    /// Allocate a buffer for `num_samples` elements of `format`.
    ///
    /// Returns `None` if the buffer count or memory limit would be exceeded.
    #[must_use]
    pub fn try_allocate(&self, format: SampleFormat, num_samples: usize) -> Option<PooledBuffer> {
        let Some(bytes) = num_samples.checked_mul(format.element_size()) else {
            return self.refuse(format, num_samples, "size overflow");
        };

        // Try to acquire semaphore permit without blocking
        let Ok(permit) = self.inner.semaphore.try_acquire() else {
            return self.refuse(format, num_samples, "buffer limit reached");
        };

        let max_memory = self.inner.max_memory;
        let reserved = self
            .inner
            .memory_in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= max_memory)
            });
        if reserved.is_err() {
            // Dropping the permit hands it back.
            drop(permit);
            return self.refuse(format, num_samples, "memory limit reached");
        }

        // Forget the permit - we'll re-add it when buffer is returned
        permit.forget();

        let mut buffer = self.inner.free_buffers.pop().unwrap_or_default();
        buffer.clear();
        buffer.resize(bytes, 0);

        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);

        Some(PooledBuffer {
            buffer: Some(buffer),
            format,
            reserved: bytes,
            pool: Arc::clone(&self.inner),
        })
    }

    fn refuse(&self, format: SampleFormat, num_samples: usize, reason: &str) -> Option<PooledBuffer> {
        self.inner.total_refused.fetch_add(1, Ordering::Relaxed);
        debug!(?format, num_samples, reason, "Buffer allocation refused");
        None
    }

    /// Number of buffers that can still be allocated.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    /// Number of buffers currently out of the pool, including frozen ones
    /// still referenced by consumers or last-delivered slots.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.max_buffers - self.available()
    }

    #[must_use]
    pub fn max_buffers(&self) -> usize {
        self.inner.max_buffers
    }

    #[must_use]
    pub fn max_memory(&self) -> usize {
        self.inner.max_memory
    }

    /// Bytes of sample data currently out of the pool.
    #[must_use]
    pub fn memory_in_use(&self) -> usize {
        self.inner.memory_in_use.load(Ordering::Acquire)
    }

    /// Total number of buffer allocations since pool creation.
    #[must_use]
    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Relaxed)
    }

    /// Total number of buffer returns since pool creation.
    #[must_use]
    pub fn total_returns(&self) -> u64 {
        self.inner.total_returns.load(Ordering::Relaxed)
    }

    /// Total number of refused allocations since pool creation.
    #[must_use]
    pub fn total_refused(&self) -> u64 {
        self.inner.total_refused.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_buffers", &self.inner.max_buffers)
            .field("max_memory", &self.inner.max_memory)
            .field("available", &self.available())
            .field("memory_in_use", &self.memory_in_use())
            .finish()
    }
}

/// A buffer allocated from the pool with automatic return on drop.
///
/// Convert to `bytes::Bytes` via `freeze()` to hand the data to consumers
/// without copying.
pub struct PooledBuffer {
    /// The actual buffer (Option for take-on-freeze)
    buffer: Option<Vec<u8>>,
    format: SampleFormat,
    /// Bytes reserved against the pool memory limit
    reserved: usize,
    /// Reference to pool for return on drop
    pool: Arc<BufferPoolInner>,
}

impl PooledBuffer {
    #[must_use]
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of samples the buffer holds.
    #[must_use]
    pub fn num_samples(&self) -> usize {
        self.len() / self.format.element_size()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }

    /// Raw byte access for producers that copy hardware data directly.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }

    /// Store `samples` at the start of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `T` does not match the buffer format or the samples exceed the
    /// buffer capacity.
    pub fn write_samples<T: Sample>(&mut self, samples: &[T]) {
        self.assert_format::<T>();
        let size = self.format.element_size();
        assert!(
            samples.len() <= self.num_samples(),
            "write_samples: {} samples exceeds buffer capacity ({})",
            samples.len(),
            self.num_samples()
        );
        for (chunk, sample) in self.as_mut_slice().chunks_exact_mut(size).zip(samples) {
            sample.write_ne(chunk);
        }
    }

    /// Fill every sample from `f(index)`.
    ///
    /// # Panics
    ///
    /// Panics if `T` does not match the buffer format.
    pub fn fill_with<T: Sample>(&mut self, mut f: impl FnMut(usize) -> T) {
        self.assert_format::<T>();
        let size = self.format.element_size();
        for (index, chunk) in self.as_mut_slice().chunks_exact_mut(size).enumerate() {
            f(index).write_ne(chunk);
        }
    }

    fn assert_format<T: Sample>(&self) {
        assert_eq!(
            T::FORMAT,
            self.format,
            "sample type does not match buffer format"
        );
    }

    /// Convert this buffer into `bytes::Bytes` (zero-copy).
    ///
    /// When the returned `Bytes` (and all its clones) are dropped, the
    /// buffer is returned to the pool.
    #[must_use]
    pub fn freeze(mut self) -> Bytes {
        let buffer = self.buffer.take().unwrap_or_default();
        let owner = BufferOwner {
            buffer,
            reserved: self.reserved,
            pool: Arc::clone(&self.pool),
        };

        // This does NOT copy the data - just wraps it
        Bytes::from_owner(owner)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // If buffer hasn't been frozen, return it to the pool
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(buffer, self.reserved);
        }
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("format", &self.format)
            .field("len", &self.len())
            .finish()
    }
}

/// Internal wrapper for buffer ownership in Bytes.
///
/// Created by `PooledBuffer::freeze()`; returns the buffer to the pool when
/// the last `Bytes` clone is dropped.
struct BufferOwner {
    buffer: Vec<u8>,
    reserved: usize,
    pool: Arc<BufferPoolInner>,
}

impl AsRef<[u8]> for BufferOwner {
    fn as_ref(&self) -> &[u8] {
        &self.buffer
    }
}

impl Drop for BufferOwner {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.give_back(buffer, self.reserved);
    }
}
