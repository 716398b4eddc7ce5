//! A contiguous byte range of a file read by one disk thread and drained by one consumer.
//!
//! # Protocol
//!
//! The disk thread calls [ScanRange::perform_read] whenever the range is scheduled. Each call takes
//! one buffer (the caller-supplied buffer, or the most recently recycled pooled buffer), fills it
//! outside of any range lock, and appends it to the ready queue. If no buffer is available the
//! range is marked as blocked and the call returns [ReadOutcome::BlockedOnBuffer]; the range is
//! handed back to its [Context] as soon as the consumer returns a buffer it can reuse.
//!
//! The consumer (see [Consumer]) takes buffers off the ready queue in file order and returns them
//! when done. A returned buffer is kept for the next read only while the range still needs more
//! buffer capacity than it holds; otherwise it is freed.
//!
//! # Locking
//!
//! The queues and counters of a range are guarded by a single lock. The [Reader] is guarded by a
//! second lock that is held across the physical transfer. The range lock is never held while
//! calling into the [Context], and the reader lock is never held while acquiring the range lock.

use crate::{
    choose_buffer_sizes, Allocator, BufferDescriptor, Context, Error, Metrics, Reader,
};
use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::SystemTime,
};
use tracing::{debug, error, trace, warn};

/// Unique identifier of a [ScanRange] within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RangeId(u64);

impl RangeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a single [ScanRange::perform_read].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A buffer was queued and it was the last one of the range.
    SuccessEosr,
    /// A buffer was queued and more reads are needed.
    SuccessMore,
    /// No buffer was available. The range will be scheduled again once one is returned.
    BlockedOnBuffer,
    /// The range was cancelled (or the read failed) and will not be read further.
    Cancelled,
}

/// How buffers are supplied to a [ScanRange].
#[derive(Default)]
pub struct BufferOpts {
    /// Attempt to serve the whole range from a read-through cache before reading from disk.
    pub try_cache: bool,
    /// If set, reads fail if the file was modified since this time.
    pub mtime: Option<SystemTime>,
    /// Read into this buffer instead of buffers from the allocator. Must be at least as long as
    /// the range.
    pub client_buffer: Option<Vec<u8>>,
}

impl BufferOpts {
    /// Read through buffers from the allocator, trying the cache first.
    pub fn cached() -> Self {
        Self {
            try_cache: true,
            ..Self::default()
        }
    }

    /// Read through buffers from the allocator without consulting the cache.
    pub fn uncached() -> Self {
        Self::default()
    }

    /// Read the whole range into `buffer`.
    pub fn client(buffer: Vec<u8>) -> Self {
        Self {
            client_buffer: Some(buffer),
            ..Self::default()
        }
    }

    /// Fail reads if the file was modified after `mtime`.
    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

/// Configuration for a [ScanRange].
pub struct Config {
    /// The file to read.
    pub file: String,

    /// Offset within the file of the first byte of the range.
    pub offset: u64,

    /// Length of the range in bytes.
    pub len: u64,

    /// The disk (or remote backend) that serves the file.
    pub disk_id: usize,

    /// Whether the file is expected to be stored on the local node.
    pub expected_local: bool,

    /// How buffers are supplied to the range.
    pub buffer_opts: BufferOpts,

    /// Maximum number of bytes requested from the [Reader] in a single call. Some backends
    /// (notably object stores) perform better with many small transfers. Never changes the length
    /// of the range.
    pub max_read_chunk: Option<NonZeroUsize>,

    /// Hint for the [Reader] to keep its file handle open across ranges.
    pub cache_handle: bool,

    /// Opaque caller metadata attached to the range.
    pub meta: Option<Arc<dyn Any + Send + Sync>>,
}

impl Config {
    pub fn new(file: impl Into<String>, offset: u64, len: u64, buffer_opts: BufferOpts) -> Self {
        Self {
            file: file.into(),
            offset,
            len,
            disk_id: 0,
            expected_local: false,
            buffer_opts,
            max_read_chunk: None,
            cache_handle: false,
            meta: None,
        }
    }
}

/// The kind of memory a range reads into, when it is not the allocator's.
enum External {
    None,
    /// The caller's buffer, until a read takes it.
    Client(Option<Vec<u8>>),
    /// The range was served from the cache. `outstanding` until the cached buffer is freed.
    Cached { outstanding: bool },
}

struct State {
    /// Filled buffers in file order.
    ready: VecDeque<BufferDescriptor>,
    /// Empty pooled buffers. Reused last-in first-out.
    unused: Vec<BufferDescriptor>,
    /// Sum of the capacities of `unused`.
    unused_bytes: usize,
    /// Cumulative capacity of the pooled buffers taken for reads.
    pool_bytes_used: u64,
    bytes_read: u64,
    read_in_flight: bool,
    status: Result<(), Error>,
    eosr_queued: bool,
    blocked_on_buffer: bool,
    /// Buffers currently held by the consumer.
    buffers_in_reader: usize,
    external: External,
}

impl State {
    fn is_cancelled(&self) -> bool {
        self.status.is_err()
    }

    fn is_finished(&self) -> bool {
        self.is_cancelled() || self.eosr_queued
    }

    /// Whether every buffer the range will ever produce has been handed to the consumer.
    fn all_buffers_returned(&self) -> bool {
        self.is_cancelled() || (self.eosr_queued && self.ready.is_empty())
    }

    /// Take the buffer for the next read of the range.
    fn next_buffer(&mut self, range: RangeId) -> Option<BufferDescriptor> {
        match &mut self.external {
            External::Client(slot) => {
                return slot.take().map(|data| BufferDescriptor::client(range, data))
            }
            External::Cached { .. } => return None,
            External::None => {}
        }
        let buffer = self.pop_unused()?;
        self.pool_bytes_used += buffer.capacity() as u64;
        Some(buffer)
    }

    fn pop_unused(&mut self) -> Option<BufferDescriptor> {
        let buffer = self.unused.pop()?;
        self.unused_bytes -= buffer.capacity();
        Some(buffer)
    }
}

/// A contiguous byte range of a file, read sequentially through recycled buffers.
pub struct ScanRange {
    id: RangeId,
    file: String,
    offset: u64,
    len: u64,
    disk_id: usize,
    expected_local: bool,
    try_cache: bool,
    mtime: Option<SystemTime>,
    cache_handle: bool,
    max_read_chunk: usize,
    meta: Option<Arc<dyn Any + Send + Sync>>,

    allocator: Arc<dyn Allocator>,
    metrics: Arc<Metrics>,
    context: OnceLock<Arc<dyn Context>>,
    consumer_taken: AtomicBool,

    reader: Mutex<Box<dyn Reader>>,
    state: Mutex<State>,
    /// Signalled when a buffer is queued, a read completes, or the range is cancelled.
    buffer_ready: Condvar,
}

impl ScanRange {
    /// Create a new range that reads through `reader`, allocating buffers from `allocator`.
    ///
    /// # Panics
    ///
    /// Panics if a client buffer shorter than the range is supplied.
    pub fn new(
        cfg: Config,
        reader: impl Reader,
        allocator: Arc<dyn Allocator>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let external = match cfg.buffer_opts.client_buffer {
            Some(buffer) => {
                assert!(
                    buffer.len() as u64 >= cfg.len,
                    "client buffer shorter than range"
                );
                External::Client(Some(buffer))
            }
            None => External::None,
        };
        let range = Arc::new(Self {
            id: RangeId::next(),
            file: cfg.file,
            offset: cfg.offset,
            len: cfg.len,
            disk_id: cfg.disk_id,
            expected_local: cfg.expected_local,
            try_cache: cfg.buffer_opts.try_cache,
            mtime: cfg.buffer_opts.mtime,
            cache_handle: cfg.cache_handle,
            max_read_chunk: cfg.max_read_chunk.map_or(usize::MAX, NonZeroUsize::get),
            meta: cfg.meta,
            allocator,
            metrics,
            context: OnceLock::new(),
            consumer_taken: AtomicBool::new(false),
            reader: Mutex::new(Box::new(reader)),
            state: Mutex::new(State {
                ready: VecDeque::new(),
                unused: Vec::new(),
                unused_bytes: 0,
                pool_bytes_used: 0,
                bytes_read: 0,
                read_in_flight: false,
                status: Ok(()),
                eosr_queued: false,
                blocked_on_buffer: false,
                buffers_in_reader: 0,
                external,
            }),
            buffer_ready: Condvar::new(),
        });
        debug_assert!(range.validate(&range.state.lock()));
        range
    }

    pub fn id(&self) -> RangeId {
        self.id
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn disk_id(&self) -> usize {
        self.disk_id
    }

    pub fn expected_local(&self) -> bool {
        self.expected_local
    }

    pub fn try_cache(&self) -> bool {
        self.try_cache
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    pub fn meta(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.meta.as_ref()
    }

    /// Number of bytes queued for the consumer so far.
    pub fn bytes_read(&self) -> u64 {
        self.state.lock().bytes_read
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().is_cancelled()
    }

    /// The sticky status of the range: the first error it was cancelled with, if any.
    pub fn status(&self) -> Result<(), Error> {
        self.state.lock().status.clone()
    }

    /// Attach the range to the [Context] that schedules it.
    ///
    /// # Panics
    ///
    /// Panics if the range is already attached to a context.
    pub fn bind(&self, context: Arc<dyn Context>) {
        assert!(
            self.context.set(context).is_ok(),
            "range already bound to a context"
        );
    }

    /// Take the consumer side of the range. Returns `None` while another [Consumer] exists.
    pub fn consumer(self: &Arc<Self>) -> Option<Consumer> {
        if self.consumer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Consumer {
            range: self.clone(),
        })
    }

    /// Allocate buffers for this range, using at most `max_bytes`, and keep them for future reads.
    ///
    /// If the allocator runs out part way, the buffers obtained so far are kept and the error is
    /// returned. The range itself is not affected by the error.
    pub fn allocate_buffers(self: &Arc<Self>, max_bytes: usize) -> Result<(), Error> {
        if self.len == 0 {
            // The end of an empty range is queued without pool memory
            return Ok(());
        }
        let sizes = choose_buffer_sizes(
            self.len,
            max_bytes,
            self.allocator.min_buffer_size(),
            self.allocator.max_buffer_size(),
        );
        let mut buffers = Vec::with_capacity(sizes.len());
        let mut result = Ok(());
        for size in sizes {
            match self.allocator.allocate(size) {
                Ok(buffer) => buffers.push(BufferDescriptor::pooled(
                    self.id,
                    buffer,
                    self.allocator.clone(),
                )),
                Err(err) => {
                    debug!(range = %self.id, size, %err, "buffer allocation failed");
                    result = Err(err.into());
                    break;
                }
            }
        }
        if !buffers.is_empty() {
            self.add_unused_buffers(buffers, false);
        }
        result
    }

    /// Mark the range as waiting for a buffer, for schedulers that could not allocate one before
    /// dispatching it.
    pub fn set_blocked_on_buffer(&self) {
        self.state.lock().blocked_on_buffer = true;
    }

    /// Read the next buffer of the range. Must only be called by one disk thread at a time.
    pub fn perform_read(&self, disk_id: usize) -> ReadOutcome {
        let (mut buffer, start) = {
            let mut state = self.state.lock();
            debug_assert!(!state.read_in_flight, "concurrent reads of one range");
            if state.is_cancelled() {
                return ReadOutcome::Cancelled;
            }
            let buffer = if self.len == 0 && matches!(state.external, External::None) {
                // Nothing to read, the end-of-range marker needs no pool memory
                Some(BufferDescriptor::client(self.id, Vec::new()))
            } else {
                state.next_buffer(self.id)
            };
            let Some(buffer) = buffer else {
                // Rescheduled when a buffer is returned
                state.blocked_on_buffer = true;
                drop(state);
                self.metrics.blocked_on_buffer.inc();
                trace!(range = %self.id, "blocked on buffer");
                return ReadOutcome::BlockedOnBuffer;
            };
            state.read_in_flight = true;
            (buffer, state.bytes_read)
        };

        // No range lock is held across the transfer
        let remaining = self.len - start;
        let want = buffer
            .capacity()
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.metrics.reads_in_flight.inc();
        let result = self.fill(&mut buffer, start, want);
        self.metrics.reads_in_flight.dec();

        let filled = match result {
            Ok(filled) => filled,
            Err(err) => {
                warn!(range = %self.id, file = %self.file, start, disk_id, %err, "read failed");
                buffer.free();
                drop(buffer);
                self.cancel_internal(err, true);
                self.close_reader();
                if let Some(context) = self.context.get() {
                    context.remove_active(self);
                }
                return ReadOutcome::Cancelled;
            }
        };

        // A short read means the file ended before the range did
        let eosr = filled < want || start + filled as u64 == self.len;
        buffer.set_filled(filled, start, eosr);
        trace!(range = %self.id, start, filled, eosr, disk_id, "read buffer");
        if !self.enqueue_ready_buffer(buffer) {
            self.close_reader();
            return ReadOutcome::Cancelled;
        }
        self.metrics.reads.inc();
        self.metrics.read_bytes.inc_by(filled as u64);
        if eosr {
            self.close_reader();
            return ReadOutcome::SuccessEosr;
        }
        ReadOutcome::SuccessMore
    }

    /// Open the reader and read `want` bytes of the range starting at `start` into `buffer`, in
    /// chunks of at most `max_read_chunk` bytes.
    fn fill(&self, buffer: &mut BufferDescriptor, start: u64, want: usize) -> Result<usize, Error> {
        let offset = self
            .offset
            .checked_add(start)
            .ok_or(Error::OffsetOverflow)?;
        let mut reader = self.reader.lock();
        reader.open(&self.file, self.mtime, self.cache_handle)?;
        let dest = &mut buffer.spare_mut()[..want];
        let mut filled = 0;
        while filled < want {
            let end = want.min(filled.saturating_add(self.max_read_chunk));
            let position = offset
                .checked_add(filled as u64)
                .ok_or(Error::OffsetOverflow)?;
            let read = reader.read_at(position, &mut dest[filled..end])?;
            filled += read;
            if filled < end {
                break;
            }
        }
        Ok(filled)
    }

    /// Serve the whole range from the reader's read-through cache.
    ///
    /// Returns `Ok(false)` if the data is not cached (or only partially cached), in which case the
    /// range must be read with [Self::perform_read]. On a hit, a single cached buffer covering the
    /// whole range is queued and no pooled buffers are used.
    pub fn read_from_cache(&self) -> Result<bool, Error> {
        debug_assert!(self.try_cache, "range does not allow cached reads");
        self.reader
            .lock()
            .open(&self.file, self.mtime, false)?;
        let client = {
            let state = self.state.lock();
            state.status.clone()?;
            debug_assert_eq!(state.bytes_read, 0);
            !matches!(state.external, External::None)
        };
        if client {
            // Ranges reading into a caller buffer always go to disk
            self.close_reader();
            return Ok(false);
        }

        let len = usize::try_from(self.len).map_err(|_| Error::OffsetOverflow)?;
        let cached = self.reader.lock().cached(self.offset, len);
        let region = match cached {
            Some(region) if region.len() >= len => region,
            Some(region) => {
                // The file may have been truncated
                debug!(
                    range = %self.id,
                    file = %self.file,
                    expected = len,
                    actual = region.len(),
                    "partial cache entry, switching to disk read path"
                );
                self.metrics.cache_misses.inc();
                self.close_reader();
                return Ok(false);
            }
            None => {
                debug!(range = %self.id, file = %self.file, "cache miss, switching to disk read path");
                self.metrics.cache_misses.inc();
                self.close_reader();
                return Ok(false);
            }
        };

        self.state.lock().external = External::Cached { outstanding: true };
        let mut buffer = BufferDescriptor::cached(self.id, region.slice(..len));
        buffer.set_filled(len, 0, true);
        if !self.enqueue_ready_buffer(buffer) {
            return Ok(false);
        }
        self.metrics.cache_hits.inc();
        self.metrics.read_bytes.inc_by(len as u64);
        Ok(true)
    }

    /// Queue a filled buffer for the consumer. Returns false (and frees the buffer) if the range
    /// was cancelled.
    fn enqueue_ready_buffer(&self, buffer: BufferDescriptor) -> bool {
        debug_assert!(!buffer.is_freed(), "cannot enqueue freed buffer");
        let mut state = self.state.lock();
        debug_assert!(self.validate(&state));
        debug_assert!(!state.eosr_queued);
        if !buffer.is_cached() {
            debug_assert!(state.read_in_flight);
            state.read_in_flight = false;
        }
        if state.is_cancelled() {
            let close = self.clean_up_buffer(&mut state, buffer);
            drop(state);
            // Cancel may be waiting for the read to finish
            self.buffer_ready.notify_all();
            if close {
                self.close_reader();
            }
            return false;
        }

        state.bytes_read += buffer.len() as u64;
        if buffer.eosr() {
            // Buffers allocated beyond what the file held are no longer needed
            self.clean_up_unused_buffers(&mut state);
        }
        state.eosr_queued = buffer.eosr();
        state.ready.push_back(buffer);
        debug_assert!(self.validate(&state));
        drop(state);
        self.buffer_ready.notify_one();
        true
    }

    /// Block until the next buffer is ready, returning `Ok(None)` once the range is complete and
    /// the first error if it was cancelled.
    fn get_next(&self) -> Result<Option<BufferDescriptor>, Error> {
        let buffer = {
            let mut state = self.state.lock();
            debug_assert!(self.validate(&state));
            while !state.all_buffers_returned() && state.ready.is_empty() {
                self.buffer_ready.wait(&mut state);
            }
            if state.all_buffers_returned() {
                // Wait for the read to finish so its buffer is freed
                while state.read_in_flight {
                    self.buffer_ready.wait(&mut state);
                }
                debug_assert!(state.ready.is_empty());
                return state.status.clone().map(|_| None);
            }
            let buffer = state.ready.pop_front().expect("ready queue is not empty");
            debug_assert!(!buffer.eosr() || state.unused.is_empty(), "{:?}", self.summary(&state));
            state.buffers_in_reader += 1;
            buffer
        };

        if buffer.eosr() {
            if let Some(context) = self.context.get() {
                context.remove_active(self);
            }
        }
        Ok(Some(buffer))
    }

    /// Hand buffers back from the consumer.
    fn return_buffers(self: &Arc<Self>, buffers: Vec<BufferDescriptor>) {
        self.add_unused_buffers(buffers, true);
    }

    /// Keep buffers for future reads if the range still needs them, freeing the rest.
    ///
    /// `returned` indicates the buffers were held by the consumer.
    fn add_unused_buffers(self: &Arc<Self>, buffers: Vec<BufferDescriptor>, returned: bool) {
        if buffers.is_empty() {
            return;
        }
        let mut unblocked = false;
        let mut close = false;
        {
            let mut state = self.state.lock();
            if returned {
                state.buffers_in_reader = state
                    .buffers_in_reader
                    .checked_sub(buffers.len())
                    .expect("returned more buffers than were handed out");
            }
            for mut buffer in buffers {
                debug_assert_eq!(buffer.range(), self.id, "buffer from another range");
                debug_assert!(!buffer.is_freed(), "cannot recycle freed buffer");
                // Don't hold on to buffers of ranges that use external memory, are done, or
                // already have enough buffers for the remainder
                let needed = self.len.saturating_sub(state.pool_bytes_used);
                if !matches!(state.external, External::None)
                    || state.is_finished()
                    || state.unused_bytes as u64 >= needed
                {
                    close |= self.clean_up_buffer(&mut state, buffer);
                    continue;
                }
                buffer.reset();
                state.unused_bytes += buffer.capacity();
                state.unused.push(buffer);
                if state.blocked_on_buffer {
                    state.blocked_on_buffer = false;
                    unblocked = true;
                }
            }
            debug_assert!(self.validate(&state));
        }
        if close {
            self.close_reader();
        }

        // The range lock must be released before the context's lock is acquired
        if unblocked {
            if let Some(context) = self.context.get() {
                // The context may have been cancelled after the range lock was released
                if !context.is_cancelled() {
                    trace!(range = %self.id, "unblocked");
                    context.schedule(self.clone());
                }
            }
        }
    }

    /// Free buffers that belong to this range without considering them for reuse.
    pub fn clean_up_buffers(&self, buffers: Vec<BufferDescriptor>) {
        let mut close = false;
        {
            let mut state = self.state.lock();
            for buffer in buffers {
                close |= self.clean_up_buffer(&mut state, buffer);
            }
        }
        if close {
            self.close_reader();
        }
    }

    /// Free `buffer`. Returns true if the reader should be closed because the range is finished
    /// and the consumer holds no more buffers.
    fn clean_up_buffer(&self, state: &mut State, mut buffer: BufferDescriptor) -> bool {
        debug_assert_eq!(buffer.range(), self.id, "buffer from another range");
        if buffer.is_cached() {
            state.external = External::Cached { outstanding: false };
        }
        buffer.free();
        state.all_buffers_returned() && state.buffers_in_reader == 0
    }

    fn clean_up_unused_buffers(&self, state: &mut State) -> bool {
        let mut close = false;
        while let Some(buffer) = state.pop_unused() {
            close |= self.clean_up_buffer(state, buffer);
        }
        close
    }

    fn close_reader(&self) {
        self.reader.lock().close();
    }

    /// Cancel the range with `err`.
    ///
    /// Cancelling a range that was never attached to a context is a no-op, and only the first
    /// error is kept. Queued and unused buffers are freed, waiters are woken, and the call returns
    /// once any read in flight has completed.
    pub fn cancel(&self, err: Error) {
        let Some(context) = self.context.get() else {
            return;
        };
        self.cancel_internal(err, false);
        // Once cancelled no read is started, but one may already be running
        self.wait_for_in_flight_read();
        context.remove_active(self);
    }

    fn cancel_internal(&self, err: Error, read_error: bool) {
        let (first, close) = {
            let mut state = self.state.lock();
            debug_assert!(self.validate(&state));
            let first = state.status.is_ok();
            if first {
                state.status = Err(err);
            }
            let mut close = false;
            while let Some(buffer) = state.ready.pop_front() {
                close |= self.clean_up_buffer(&mut state, buffer);
            }
            close |= self.clean_up_unused_buffers(&mut state);
            if read_error {
                debug_assert!(state.read_in_flight);
                state.read_in_flight = false;
            }
            debug_assert!(self.validate(&state));

            // A cached buffer held by the consumer must be returned before the reader is closed
            let outstanding = matches!(state.external, External::Cached { outstanding: true });
            (first, close || !outstanding)
        };
        self.buffer_ready.notify_all();
        if first {
            self.metrics.cancelled.inc();
            debug!(range = %self.id, file = %self.file, "cancelled");
        }
        if close {
            self.close_reader();
        }
    }

    /// Block until no read of this range is executing.
    pub fn wait_for_in_flight_read(&self) {
        let mut state = self.state.lock();
        while state.read_in_flight {
            self.buffer_ready.wait(&mut state);
        }
    }

    /// Check the invariants of `state`, logging the first violation.
    fn validate(&self, state: &State) -> bool {
        if state.bytes_read > self.len {
            error!(
                bytes_read = state.bytes_read,
                len = self.len,
                "read past the end of the range"
            );
            return false;
        }
        if state.is_cancelled() && !state.ready.is_empty() {
            error!(range = ?self.summary(state), "cancelled range has queued buffers");
            return false;
        }
        let unused_bytes: usize = state.unused.iter().map(BufferDescriptor::capacity).sum();
        if unused_bytes != state.unused_bytes {
            error!(
                tracked = state.unused_bytes,
                actual = unused_bytes,
                "unused buffer bytes incorrect"
            );
            return false;
        }
        if state.is_finished() && !state.unused.is_empty() {
            error!(range = ?self.summary(state), "finished range holds unused buffers");
            return false;
        }
        if !state.is_finished() && state.blocked_on_buffer && !state.unused.is_empty() {
            error!(range = ?self.summary(state), "blocked despite having buffers");
            return false;
        }
        true
    }

    fn summary<'a>(&'a self, state: &'a State) -> Summary<'a> {
        Summary { range: self, state }
    }
}

impl fmt::Debug for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        fmt::Debug::fmt(&self.summary(&state), f)
    }
}

/// Diagnostic view of a range and its (already locked) state.
struct Summary<'a> {
    range: &'a ScanRange,
    state: &'a State,
}

impl fmt::Debug for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { range, state } = self;
        f.debug_struct("ScanRange")
            .field("id", &range.id)
            .field("file", &range.file)
            .field("disk_id", &range.disk_id)
            .field("offset", &range.offset)
            .field("len", &range.len)
            .field("bytes_read", &state.bytes_read)
            .field("status", &state.status)
            .field("ready_buffers", &state.ready.len())
            .field("buffers_in_reader", &state.buffers_in_reader)
            .field("unused_buffers", &state.unused.len())
            .field("unused_buffer_bytes", &state.unused_bytes)
            .field("read_in_flight", &state.read_in_flight)
            .field("eosr_queued", &state.eosr_queued)
            .field("blocked_on_buffer", &state.blocked_on_buffer)
            .finish()
    }
}

/// The consumer side of a [ScanRange].
///
/// At most one consumer of a range exists at a time, so buffers are always taken off the ready
/// queue in the order they were produced.
pub struct Consumer {
    range: Arc<ScanRange>,
}

impl Consumer {
    pub fn range(&self) -> &Arc<ScanRange> {
        &self.range
    }

    /// Block until the next buffer of the range is ready.
    ///
    /// Returns `Ok(None)` once every buffer has been delivered, or the error the range was
    /// cancelled with. Once the range is finished this never blocks.
    pub fn get_next(&mut self) -> Result<Option<BufferDescriptor>, Error> {
        self.range.get_next()
    }

    /// Hand a buffer obtained from [Self::get_next] back to the range.
    pub fn return_buffer(&mut self, buffer: BufferDescriptor) {
        self.range.return_buffers(vec![buffer]);
    }

    /// Hand several buffers obtained from [Self::get_next] back to the range.
    pub fn return_buffers(&mut self, buffers: Vec<BufferDescriptor>) {
        self.range.return_buffers(buffers);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.range.consumer_taken.store(false, Ordering::Release);
    }
}
