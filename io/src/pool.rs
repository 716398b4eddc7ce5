//! Buffer pool backing the reads of [crate::ScanRange]s.
//!
//! Ranges never allocate memory on their own: they are constructed with an [Allocator]
//! capability and follow a strict allocate/free protocol against it. [BufferPool] is the default
//! implementation, shared by every range of a process.
//!
//! The pool hands out buffers in power-of-two sizes between `min_size` and `max_size`, rounding
//! each request up. For each size it keeps the freed buffers in a lock-free queue
//! ([crossbeam_queue::ArrayQueue]) and reuses them before creating new ones. At most
//! `max_per_class` buffers of a size exist at once: past that, allocation fails with
//! [PoolError::Exhausted]. Requests larger than `max_size` fail with [PoolError::Oversized].

use crate::NZUsize;
use crossbeam_queue::ArrayQueue;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};
use thiserror::Error;

/// Error returned when buffer pool allocation fails.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("requested capacity exceeds maximum buffer size")]
    Oversized,
    #[error("pool exhausted for required size class")]
    Exhausted,
}

/// A capability to allocate and free I/O buffers.
///
/// Every buffer obtained from [Allocator::allocate] must be handed back exactly once through
/// [Allocator::free] on the same allocator.
pub trait Allocator: Send + Sync + 'static {
    /// Allocate a buffer of at least `len` bytes.
    fn allocate(&self, len: usize) -> Result<PooledBuffer, PoolError>;

    /// Return a buffer previously obtained from [Allocator::allocate].
    fn free(&self, buffer: PooledBuffer);

    /// The smallest buffer this allocator hands out.
    fn min_buffer_size(&self) -> usize;

    /// The largest buffer this allocator hands out.
    fn max_buffer_size(&self) -> usize;
}

/// A buffer allocated from an [Allocator].
///
/// The whole capacity is initialized (zeroed on first allocation) and writable.
pub struct PooledBuffer {
    data: Box<[u8]>,
}

impl PooledBuffer {
    /// Wrap memory that an [Allocator] implementation owns.
    pub fn new(data: Box<[u8]>) -> Self {
        Self { data }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Consume the handle, returning the underlying memory.
    pub fn into_inner(self) -> Box<[u8]> {
        self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Configuration for a [BufferPool].
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Smallest buffer size. Must be a power of two.
    pub min_size: NonZeroUsize,

    /// Largest buffer size. Must be a power of two no smaller than `min_size`.
    pub max_size: NonZeroUsize,

    /// Maximum number of buffers of each size that may exist at once.
    pub max_per_class: NonZeroUsize,

    /// Allocate every buffer up front instead of on first use.
    pub prefill: bool,
}

impl Default for BufferPoolConfig {
    /// 8KB to 8MB buffers, 32 per size, allocated on first use.
    fn default() -> Self {
        Self {
            min_size: NZUsize!(8 * 1024),
            max_size: NZUsize!(8 * 1024 * 1024),
            max_per_class: NZUsize!(32),
            prefill: false,
        }
    }
}

impl BufferPoolConfig {
    /// Object store preset: 8KB to 128KB buffers, 256 per size, allocated on first use.
    ///
    /// Remote reads are issued in small chunks, so there is no benefit in buffers larger than a
    /// single transfer.
    pub const fn for_remote() -> Self {
        Self {
            min_size: NZUsize!(8 * 1024),
            max_size: NZUsize!(128 * 1024),
            max_per_class: NZUsize!(256),
            prefill: false,
        }
    }

    /// # Panics
    ///
    /// Panics if either size is not a power of two or if `max_size < min_size`.
    fn assert_valid(&self) {
        assert!(
            self.min_size.is_power_of_two() && self.max_size.is_power_of_two(),
            "buffer sizes must be powers of two"
        );
        assert!(self.min_size <= self.max_size, "max_size must be >= min_size");
    }

    /// Buffer sizes handed out by the pool, smallest first.
    fn sizes(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(self.min_size.get()), |size| size.checked_mul(2))
            .take_while(|size| *size <= self.max_size.get())
    }

    /// Index into [Self::sizes] of the smallest buffer that holds `len` bytes.
    fn class_of(&self, len: usize) -> Option<usize> {
        if len > self.max_size.get() {
            return None;
        }
        let size = len.max(self.min_size.get()).next_power_of_two();
        Some((size.trailing_zeros() - self.min_size.trailing_zeros()) as usize)
    }
}

/// Pool metrics, labelled by buffer size.
struct PoolMetrics {
    allocated: Family<SizeLabel, Gauge>,
    allocations: Family<SizeLabel, Counter>,
    exhausted: Counter,
    oversized: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SizeLabel {
    size: u64,
}

impl PoolMetrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            allocated: Family::default(),
            allocations: Family::default(),
            exhausted: Counter::default(),
            oversized: Counter::default(),
        };
        registry.register(
            "buffer_pool_allocated",
            "Number of buffers handed out and not yet freed",
            metrics.allocated.clone(),
        );
        registry.register(
            "buffer_pool_allocations",
            "Total number of buffers handed out",
            metrics.allocations.clone(),
        );
        registry.register(
            "buffer_pool_exhausted",
            "Total number of allocations refused because a size had no buffer left",
            metrics.exhausted.clone(),
        );
        registry.register(
            "buffer_pool_oversized",
            "Total number of allocations larger than the largest buffer",
            metrics.oversized.clone(),
        );
        metrics
    }
}

/// Buffers of a single size.
struct SizeClass {
    size: usize,
    label: SizeLabel,
    /// Freed buffers, ready to be handed out again.
    idle: ArrayQueue<Box<[u8]>>,
    /// Buffers that currently exist, idle or handed out. Never exceeds the capacity of `idle`.
    created: AtomicUsize,
    /// Buffers currently handed out.
    outstanding: AtomicUsize,
}

impl SizeClass {
    fn new(size: usize, limit: usize, prefill: bool) -> Self {
        let class = Self {
            size,
            label: SizeLabel { size: size as u64 },
            idle: ArrayQueue::new(limit),
            created: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        };
        if prefill {
            for _ in 0..limit {
                let _ = class.idle.push(vec![0u8; size].into_boxed_slice());
            }
            class.created.store(limit, Ordering::Relaxed);
        }
        class
    }

    /// Take an idle buffer, or create one if the limit allows it.
    fn take(&self) -> Option<Box<[u8]>> {
        if let Some(data) = self.idle.pop() {
            return Some(data);
        }
        let limit = self.idle.capacity();
        self.created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                (created < limit).then_some(created + 1)
            })
            .ok()?;
        Some(vec![0u8; self.size].into_boxed_slice())
    }
}

/// A pool of reusable I/O buffers in power-of-two sizes.
pub struct BufferPool {
    config: BufferPoolConfig,
    classes: Vec<SizeClass>,
    metrics: PoolMetrics,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("num_classes", &self.classes.len())
            .finish()
    }
}

impl BufferPool {
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(config: BufferPoolConfig, registry: &mut Registry) -> Self {
        config.assert_valid();
        let classes = config
            .sizes()
            .map(|size| SizeClass::new(size, config.max_per_class.get(), config.prefill))
            .collect();
        Self {
            metrics: PoolMetrics::new(registry),
            config,
            classes,
        }
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// Number of buffers of the size that fits `len` currently handed out.
    pub fn allocated(&self, len: usize) -> usize {
        self.config
            .class_of(len)
            .map_or(0, |index| self.classes[index].outstanding.load(Ordering::Acquire))
    }
}

impl Allocator for BufferPool {
    fn allocate(&self, len: usize) -> Result<PooledBuffer, PoolError> {
        let Some(index) = self.config.class_of(len) else {
            self.metrics.oversized.inc();
            return Err(PoolError::Oversized);
        };
        let class = &self.classes[index];
        let Some(data) = class.take() else {
            self.metrics.exhausted.inc();
            return Err(PoolError::Exhausted);
        };
        class.outstanding.fetch_add(1, Ordering::AcqRel);
        self.metrics.allocations.get_or_create(&class.label).inc();
        self.metrics.allocated.get_or_create(&class.label).inc();
        Ok(PooledBuffer::new(data))
    }

    fn free(&self, buffer: PooledBuffer) {
        // Memory that doesn't match one of our sizes was not allocated here
        let Some(class) = self
            .config
            .class_of(buffer.capacity())
            .map(|index| &self.classes[index])
            .filter(|class| class.size == buffer.capacity())
        else {
            return;
        };
        class.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.metrics.allocated.get_or_create(&class.label).dec();
        if class.idle.push(buffer.into_inner()).is_err() {
            class.created.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn min_buffer_size(&self) -> usize {
        self.config.min_size.get()
    }

    fn max_buffer_size(&self) -> usize {
        self.config.max_size.get()
    }
}

/// Round `value` down to a power of two (`value` must be non-zero).
const fn prev_power_of_two(value: usize) -> usize {
    1 << (usize::BITS - 1 - value.leading_zeros())
}

/// Choose the sizes of the buffers to allocate for a range of `range_len` bytes, allocating at
/// most `max_bytes` in total.
///
/// Full `max_size` buffers are used while at least that much of the range remains, and the tail
/// is covered by the smallest power of two (no smaller than `min_size`) that fits it. At least one
/// buffer is always returned, even if it means exceeding the range length or shrinking the buffer
/// to the largest power of two within `max_bytes`.
pub fn choose_buffer_sizes(
    range_len: u64,
    max_bytes: usize,
    min_size: usize,
    max_size: usize,
) -> Vec<usize> {
    let max_bytes = max_bytes.max(min_size);
    let mut sizes = Vec::new();
    let mut allocated: u64 = 0;
    while allocated < range_len || sizes.is_empty() {
        let remaining = range_len - allocated;
        let mut size = if remaining >= max_size as u64 {
            max_size
        } else {
            // remaining < max_size, so it fits in usize
            (remaining as usize).next_power_of_two().max(min_size)
        };
        if allocated + size as u64 > max_bytes as u64 {
            if allocated > 0 {
                break;
            }
            size = prev_power_of_two(max_bytes);
        }
        sizes.push(size);
        allocated += size as u64;
    }
    sizes
}
