//! Scheduling of [ScanRange]s onto disk threads.

use crate::{Error, RangeId, ReadOutcome, ScanRange};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tracing::{debug, trace};

/// The owner of a set of [ScanRange]s, deciding which range is read next.
///
/// A range calls into its context without holding any of its own locks, so implementations may
/// call back into the range.
pub trait Context: Send + Sync + 'static {
    /// Called when a range that was blocked on a buffer can be read again.
    fn schedule(&self, range: Arc<ScanRange>);

    /// Called when a range will not be read further, because its last buffer was handed to the
    /// consumer or because it was cancelled. May be called more than once for a range.
    fn remove_active(&self, range: &ScanRange);

    /// Whether the whole context was cancelled, in which case ranges are not rescheduled.
    fn is_cancelled(&self) -> bool;
}

/// A range waiting for a disk thread.
struct Pending {
    range: Arc<ScanRange>,
    /// Try to serve the range from the cache before reading it.
    try_cache: bool,
}

#[derive(Default)]
struct State {
    cancelled: Option<Error>,
    shutdown: bool,
    active: HashMap<RangeId, Arc<ScanRange>>,
    /// Ranges ready to be read, per disk.
    queues: HashMap<usize, VecDeque<Pending>>,
}

/// A [Context] that reads its ranges from one thread per disk.
///
/// Ranges are read in the order they become ready. After each successful read that did not reach
/// the end of the range, the range moves to the back of its disk's queue.
#[derive(Default)]
pub struct RequestContext {
    state: Mutex<State>,
    ready: Condvar,
}

impl RequestContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take ownership of `range` and queue it for its disk.
    ///
    /// Fails if the context was cancelled.
    pub fn add_range(self: &Arc<Self>, range: &Arc<ScanRange>) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if let Some(err) = &state.cancelled {
                return Err(err.clone());
            }
            // Bound before a disk thread can see it
            range.bind(self.clone());
            state.active.insert(range.id(), range.clone());
            state
                .queues
                .entry(range.disk_id())
                .or_default()
                .push_back(Pending {
                    range: range.clone(),
                    try_cache: range.try_cache(),
                });
        }
        debug!(range = %range.id(), file = range.file(), disk_id = range.disk_id(), "added range");
        self.ready.notify_all();
        Ok(())
    }

    /// Block until a range is ready on `disk_id`. Returns `None` once the context is shut down.
    fn next_range(&self, disk_id: usize) -> Option<Pending> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(pending) = state
                .queues
                .get_mut(&disk_id)
                .and_then(VecDeque::pop_front)
            {
                return Some(pending);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Read ranges of `disk_id` until [Self::shutdown] is called.
    pub fn serve(&self, disk_id: usize) {
        while let Some(Pending { range, try_cache }) = self.next_range(disk_id) {
            if try_cache {
                match range.read_from_cache() {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(err) => {
                        range.cancel(err);
                        continue;
                    }
                }
            }
            match range.perform_read(disk_id) {
                ReadOutcome::SuccessMore => self.push(range),
                outcome => trace!(range = %range.id(), ?outcome, "range descheduled"),
            }
        }
        debug!(disk_id, "disk thread exiting");
    }

    fn push(&self, range: Arc<ScanRange>) {
        {
            let mut state = self.state.lock();
            if state.cancelled.is_some() || state.shutdown {
                return;
            }
            state
                .queues
                .entry(range.disk_id())
                .or_default()
                .push_back(Pending {
                    range,
                    try_cache: false,
                });
        }
        self.ready.notify_all();
    }

    /// Cancel every active range with `err`. Only the first cancellation has an effect.
    pub fn cancel(&self, err: Error) {
        let ranges = {
            let mut state = self.state.lock();
            if state.cancelled.is_some() {
                return;
            }
            state.cancelled = Some(err.clone());
            state.queues.clear();
            state.active.drain().map(|(_, range)| range).collect::<Vec<_>>()
        };
        debug!(ranges = ranges.len(), %err, "cancelling context");

        // Ranges call back into the context, so its lock must be released first
        for range in ranges {
            range.cancel(err.clone());
        }
    }

    /// Stop all disk threads once they finish their current read.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.ready.notify_all();
    }

    /// Number of ranges that may still be read.
    pub fn num_active(&self) -> usize {
        self.state.lock().active.len()
    }
}

impl Context for RequestContext {
    fn schedule(&self, range: Arc<ScanRange>) {
        trace!(range = %range.id(), "rescheduling range");
        self.push(range);
    }

    fn remove_active(&self, range: &ScanRange) {
        self.state.lock().active.remove(&range.id());
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reader::Memory, BufferOpts, BufferPool, BufferPoolConfig, Config, Metrics, NZUsize,
        Provenance,
    };
    use prometheus_client::registry::Registry;
    use std::thread;

    struct Harness {
        pool: Arc<BufferPool>,
        metrics: Arc<Metrics>,
    }

    impl Harness {
        fn new() -> Self {
            let mut registry = Registry::default();
            let config = BufferPoolConfig {
                min_size: NZUsize!(1024),
                max_size: NZUsize!(8192),
                max_per_class: NZUsize!(64),
                prefill: false,
            };
            Self {
                pool: Arc::new(BufferPool::new(config, &mut registry)),
                metrics: Arc::new(Metrics::new(&mut registry)),
            }
        }

        fn range(&self, cfg: Config, reader: Memory) -> Arc<ScanRange> {
            ScanRange::new(cfg, reader, self.pool.clone(), self.metrics.clone())
        }
    }

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn drain(range: &Arc<ScanRange>) -> Result<Vec<u8>, Error> {
        let mut consumer = range.consumer().unwrap();
        let mut data = Vec::new();
        while let Some(buffer) = consumer.get_next()? {
            data.extend_from_slice(buffer.data());
            consumer.return_buffer(buffer);
        }
        Ok(data)
    }

    #[test]
    fn test_serve_multiple_ranges() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let harness = Harness::new();
        let context = RequestContext::new();
        let files: Vec<_> = (0..4).map(|i| content(50_000 + i * 7_000, i as u8)).collect();
        let ranges: Vec<_> = files
            .iter()
            .enumerate()
            .map(|(i, data)| {
                let mut cfg = Config::new(format!("file-{i}"), 0, data.len() as u64, BufferOpts::uncached());
                cfg.disk_id = i % 2;
                let range = harness.range(cfg, Memory::new(data.clone()));
                range.allocate_buffers(16 * 1024).unwrap();
                range
            })
            .collect();
        for range in &ranges {
            context.add_range(range).unwrap();
        }
        assert_eq!(context.num_active(), 4);

        thread::scope(|s| {
            for disk_id in 0..2 {
                let context = &context;
                s.spawn(move || context.serve(disk_id));
            }
            let consumers: Vec<_> = ranges
                .iter()
                .map(|range| s.spawn(move || drain(range)))
                .collect();
            for (consumer, data) in consumers.into_iter().zip(&files) {
                assert_eq!(&consumer.join().unwrap().unwrap(), data);
            }
            context.shutdown();
        });
        assert_eq!(context.num_active(), 0);
        assert_eq!(harness.pool.allocated(8192), 0);
        assert_eq!(harness.pool.allocated(1024), 0);
    }

    #[test]
    fn test_serve_cached_range() {
        let harness = Harness::new();
        let context = RequestContext::new();
        let data = content(20_000, 3);
        let range = harness.range(
            Config::new("cached", 0, 20_000, BufferOpts::cached()),
            Memory::new(data.clone()).with_cache(),
        );
        context.add_range(&range).unwrap();

        thread::scope(|s| {
            s.spawn(|| context.serve(0));
            let mut consumer = range.consumer().unwrap();
            let buffer = consumer.get_next().unwrap().unwrap();
            assert_eq!(buffer.provenance(), Provenance::Cached);
            assert_eq!(buffer.data(), &data[..]);
            consumer.return_buffer(buffer);
            assert!(consumer.get_next().unwrap().is_none());
            context.shutdown();
        });
        assert_eq!(context.num_active(), 0);
    }

    #[test]
    fn test_cache_miss_reads_from_disk() {
        let harness = Harness::new();
        let context = RequestContext::new();
        let data = content(20_000, 9);
        let range = harness.range(
            Config::new("uncached", 0, 20_000, BufferOpts::cached()),
            Memory::new(data.clone()),
        );
        range.allocate_buffers(8192).unwrap();
        context.add_range(&range).unwrap();

        thread::scope(|s| {
            s.spawn(|| context.serve(0));
            assert_eq!(drain(&range).unwrap(), data);
            context.shutdown();
        });
    }

    #[test]
    fn test_cancel_context() {
        let harness = Harness::new();
        let context = RequestContext::new();
        let ranges: Vec<_> = (0..3)
            .map(|i| {
                let range = harness.range(
                    Config::new(format!("file-{i}"), 0, 100_000, BufferOpts::uncached()),
                    Memory::new(content(100_000, i)),
                );
                range.allocate_buffers(8192).unwrap();
                range
            })
            .collect();
        for range in &ranges {
            context.add_range(range).unwrap();
        }

        // Without a disk thread, nothing is read before the cancellation
        context.cancel(Error::Cancelled);
        assert!(context.is_cancelled());
        assert_eq!(context.num_active(), 0);
        for range in &ranges {
            assert!(matches!(range.status(), Err(Error::Cancelled)));
            assert!(matches!(drain(range), Err(Error::Cancelled)));
        }
        assert_eq!(harness.pool.allocated(8192), 0);

        // Later ranges are refused
        let late = harness.range(
            Config::new("late", 0, 10, BufferOpts::uncached()),
            Memory::new(content(10, 0)),
        );
        assert!(matches!(context.add_range(&late), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancel_while_serving() {
        let harness = Harness::new();
        let context = RequestContext::new();
        let range = harness.range(
            Config::new("big", 0, 10_000_000, BufferOpts::uncached()),
            Memory::new(content(10_000_000, 1)),
        );
        range.allocate_buffers(16 * 1024).unwrap();
        context.add_range(&range).unwrap();

        thread::scope(|s| {
            s.spawn(|| context.serve(0));
            let mut consumer = range.consumer().unwrap();
            let buffer = consumer.get_next().unwrap().unwrap();
            context.cancel(Error::FileModified("big".into()));
            consumer.return_buffer(buffer);
            assert!(matches!(consumer.get_next(), Err(Error::FileModified(_))));
            context.shutdown();
        });
        assert_eq!(harness.pool.allocated(8192), 0);
    }

    #[test]
    fn test_blocked_range_resumes() {
        let harness = Harness::new();
        let context = RequestContext::new();
        let data = content(64 * 1024, 5);
        let range = harness.range(
            Config::new("file", 0, data.len() as u64, BufferOpts::uncached()),
            Memory::new(data.clone()),
        );
        // A single buffer forces the range to block after every read
        range.allocate_buffers(8192).unwrap();
        context.add_range(&range).unwrap();

        thread::scope(|s| {
            s.spawn(|| context.serve(0));
            assert_eq!(drain(&range).unwrap(), data);
            context.shutdown();
        });
        assert_eq!(harness.pool.allocated(8192), 0);
    }

    #[test]
    fn test_serve_empty_range() {
        let harness = Harness::new();
        let context = RequestContext::new();
        let range = harness.range(
            Config::new("empty", 0, 0, BufferOpts::uncached()),
            Memory::new(content(1000, 0)),
        );
        range.allocate_buffers(64 * 1024).unwrap();
        context.add_range(&range).unwrap();

        thread::scope(|s| {
            s.spawn(|| context.serve(0));
            let mut consumer = range.consumer().unwrap();
            let buffer = consumer.get_next().unwrap().unwrap();
            assert!(buffer.is_empty());
            assert!(buffer.eosr());
            consumer.return_buffer(buffer);
            assert!(consumer.get_next().unwrap().is_none());
            context.shutdown();
        });
        assert_eq!(context.num_active(), 0);
        assert_eq!(harness.pool.allocated(8192), 0);
    }

    #[test]
    fn test_shutdown_stops_idle_threads() {
        let context = RequestContext::new();
        thread::scope(|s| {
            for disk_id in 0..4 {
                let context = &context;
                s.spawn(move || context.serve(disk_id));
            }
            context.shutdown();
        });
        assert_eq!(context.num_active(), 0);
    }
}
