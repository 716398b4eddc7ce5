//! Stream contiguous byte ranges of files through recycled buffers.
//!
//! A [ScanRange] describes a contiguous interval of a file that is read sequentially by a single
//! disk thread (the producer) and drained by a single consumer. Filled buffers are queued in file
//! order, handed to the consumer, and then either recycled for the next read of the same range or
//! freed back to the [Allocator] they came from.
//!
//! Buffers come from one of three places:
//! - an [Allocator] capability that the range is constructed with (usually a [BufferPool]),
//! - a buffer supplied by the creator of the range ([BufferOpts::client]),
//! - memory owned by a read-through cache, returned by [Reader::cached] when the range allows it.
//!
//! The physical transfer is delegated to a [Reader] and the choice of which range to read next is
//! delegated to a [Context], which the range notifies when it becomes unblocked or finishes.
//! [RequestContext] is a minimal [Context] that tracks active ranges and drives them from one or
//! more disk threads.
//!
//! # Example
//!
//! ```
//! use quarry_io::{reader::Memory, BufferOpts, BufferPool, BufferPoolConfig, Config, Metrics, RequestContext, ScanRange};
//! use prometheus_client::registry::Registry;
//! use std::sync::Arc;
//!
//! let mut registry = Registry::default();
//! let pool = Arc::new(BufferPool::new(BufferPoolConfig::default(), &mut registry));
//! let metrics = Arc::new(Metrics::new(&mut registry));
//!
//! // Describe the range and give it a few buffers
//! let content = vec![7u8; 100_000];
//! let range = ScanRange::new(
//!     Config::new("data.bin", 0, content.len() as u64, BufferOpts::uncached()),
//!     Memory::new(content),
//!     pool,
//!     metrics,
//! );
//! range.allocate_buffers(64 * 1024).unwrap();
//!
//! // Drive it from a disk thread while the current thread consumes it
//! let context = RequestContext::new();
//! context.add_range(&range).unwrap();
//! std::thread::scope(|s| {
//!     s.spawn(|| context.serve(0));
//!     let mut consumer = range.consumer().unwrap();
//!     let mut total = 0;
//!     while let Some(buffer) = consumer.get_next().unwrap() {
//!         total += buffer.len();
//!         consumer.return_buffer(buffer);
//!     }
//!     assert_eq!(total, 100_000);
//!     context.shutdown();
//! });
//! ```

use std::{io::Error as IoError, sync::Arc};
use thiserror::Error;

mod buffer;
pub use buffer::{BufferDescriptor, Provenance};
mod context;
pub use context::{Context, RequestContext};
mod metrics;
pub use metrics::Metrics;
mod pool;
pub use pool::{choose_buffer_sizes, Allocator, BufferPool, BufferPoolConfig, PoolError, PooledBuffer};
mod range;
pub use range::{BufferOpts, Config, Consumer, RangeId, ReadOutcome, ScanRange};
pub mod reader;
pub use reader::Reader;

/// Errors that can occur when reading a [ScanRange].
///
/// The first error recorded by a range becomes its sticky status and is returned to every
/// subsequent consumer call, so errors are cheap to clone.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("cancelled")]
    Cancelled,
    #[error("open failed: {0} error: {1}")]
    OpenFailed(String, Arc<IoError>),
    #[error("read failed: {0} offset: {1} error: {2}")]
    ReadFailed(String, u64, Arc<IoError>),
    #[error("file modified since planning: {0}")]
    FileModified(String),
    #[error("file not open")]
    FileClosed,
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("buffer pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Create a [std::num::NonZeroUsize], panicking (at compile time when used in a const context) if
/// the value is zero.
#[macro_export]
macro_rules! NZUsize {
    ($val:expr) => {
        match std::num::NonZeroUsize::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}
