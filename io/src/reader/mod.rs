//! File-access backends used by [crate::ScanRange] to perform the physical transfer.
//!
//! A [Reader] is owned by exactly one range. The range opens it before every read (opening an
//! already open reader is a no-op), and closes it once no more buffers will be produced or held.

use crate::Error;
use bytes::Bytes;
use std::time::SystemTime;

mod local;
pub use local::Local;
mod memory;
pub use memory::Memory;

/// Interface that any file-access backend must implement.
pub trait Reader: Send + 'static {
    /// Open `file`, if not already open.
    ///
    /// If `mtime` is provided, the file must not have been modified since then. `cache_handle`
    /// hints that the backend may keep the underlying handle open across ranges.
    fn open(&mut self, file: &str, mtime: Option<SystemTime>, cache_handle: bool)
        -> Result<(), Error>;

    /// Read into `buf` starting at `offset`, returning the number of bytes read.
    ///
    /// Fewer than `buf.len()` bytes are returned only when the end of the file is reached.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Error>;

    /// Close the file. Closing a reader that is not open is a no-op.
    fn close(&mut self);

    /// Return up to `len` bytes starting at `offset` from a read-through cache, if the backend
    /// has the data cached. The returned memory is owned by the cache.
    fn cached(&mut self, _offset: u64, _len: usize) -> Option<Bytes> {
        None
    }
}
