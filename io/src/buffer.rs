use crate::{Allocator, PooledBuffer, RangeId};
use bytes::Bytes;
use std::{fmt, sync::Arc};

/// Where the memory of a [BufferDescriptor] comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// Allocated from the range's [Allocator] and returned to it when freed.
    Pooled,
    /// Supplied by the creator of the range.
    Client,
    /// Owned by a read-through cache.
    Cached,
}

/// Memory backing a [BufferDescriptor].
enum Payload {
    Pooled {
        buffer: PooledBuffer,
        allocator: Arc<dyn Allocator>,
    },
    Client(Vec<u8>),
    Cached(Bytes),
}

impl Payload {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Pooled { buffer, .. } => buffer.as_ref(),
            Self::Client(data) => data,
            Self::Cached(data) => data,
        }
    }
}

/// A buffer produced by a [crate::ScanRange].
///
/// A descriptor is filled by the range's disk thread, queued, handed to the consumer, and then
/// either recycled by the range for a later read or freed. Consumers must hand every descriptor
/// back to the range it came from (see [crate::Consumer::return_buffer]) so the range can account
/// for it.
pub struct BufferDescriptor {
    range: RangeId,
    payload: Option<Payload>,
    /// Number of valid bytes.
    len: usize,
    /// Offset within the scan range of the first byte.
    range_offset: u64,
    /// Whether this buffer holds the last bytes of the scan range.
    eosr: bool,
}

impl BufferDescriptor {
    pub(crate) fn pooled(range: RangeId, buffer: PooledBuffer, allocator: Arc<dyn Allocator>) -> Self {
        Self::new(range, Payload::Pooled { buffer, allocator })
    }

    pub(crate) fn client(range: RangeId, data: Vec<u8>) -> Self {
        Self::new(range, Payload::Client(data))
    }

    pub(crate) fn cached(range: RangeId, data: Bytes) -> Self {
        Self::new(range, Payload::Cached(data))
    }

    fn new(range: RangeId, payload: Payload) -> Self {
        Self {
            range,
            payload: Some(payload),
            len: 0,
            range_offset: 0,
            eosr: false,
        }
    }

    fn payload(&self) -> &Payload {
        self.payload.as_ref().expect("buffer already freed")
    }

    /// The range this buffer belongs to.
    pub fn range(&self) -> RangeId {
        self.range
    }

    /// The bytes read into this buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer has been freed.
    pub fn data(&self) -> &[u8] {
        &self.payload().as_slice()[..self.len]
    }

    /// Number of bytes read into this buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying memory.
    ///
    /// # Panics
    ///
    /// Panics if the buffer has been freed.
    pub fn capacity(&self) -> usize {
        self.payload().as_slice().len()
    }

    /// Offset of [Self::data] within the scan range.
    pub fn range_offset(&self) -> u64 {
        self.range_offset
    }

    /// Whether this buffer holds the last bytes of the scan range.
    pub fn eosr(&self) -> bool {
        self.eosr
    }

    /// # Panics
    ///
    /// Panics if the buffer has been freed.
    pub fn provenance(&self) -> Provenance {
        match self.payload() {
            Payload::Pooled { .. } => Provenance::Pooled,
            Payload::Client(_) => Provenance::Client,
            Payload::Cached(_) => Provenance::Cached,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.payload, Some(Payload::Cached(_)))
    }

    pub fn is_freed(&self) -> bool {
        self.payload.is_none()
    }

    /// The whole writable capacity, for a disk thread to read into.
    ///
    /// # Panics
    ///
    /// Panics if the buffer has been freed or is owned by a cache.
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        match self.payload.as_mut().expect("buffer already freed") {
            Payload::Pooled { buffer, .. } => buffer.as_mut(),
            Payload::Client(data) => data,
            Payload::Cached(_) => panic!("cached buffers are read-only"),
        }
    }

    pub(crate) fn set_filled(&mut self, len: usize, range_offset: u64, eosr: bool) {
        assert!(len <= self.capacity(), "filled past capacity");
        self.len = len;
        self.range_offset = range_offset;
        self.eosr = eosr;
    }

    /// Forget the fill state before the buffer is reused for another read.
    pub(crate) fn reset(&mut self) {
        self.len = 0;
        self.range_offset = 0;
        self.eosr = false;
    }

    /// Release the memory of this buffer.
    ///
    /// Pooled buffers are returned to the allocator they were allocated from. Client and cached
    /// buffers are not owned by an allocator and are simply released. Only the first call has an
    /// effect.
    pub(crate) fn free(&mut self) {
        let Some(payload) = self.payload.take() else {
            return;
        };
        match payload {
            Payload::Pooled { buffer, allocator } => allocator.free(buffer),
            Payload::Client(_) | Payload::Cached(_) => {}
        }
    }
}

impl Drop for BufferDescriptor {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("range", &self.range)
            .field("provenance", &self.payload.as_ref().map(|_| self.provenance()))
            .field("len", &self.len)
            .field("range_offset", &self.range_offset)
            .field("eosr", &self.eosr)
            .finish()
    }
}
