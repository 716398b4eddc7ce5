use crate::{reader::Reader, Error};
use bytes::Bytes;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::SystemTime,
};

/// An in-memory [Reader].
///
/// When created with [Memory::with_cache], the whole content is also exposed as a read-through
/// cache entry. Clones share the open state and statistics, so a clone kept outside of a range
/// can be used to observe it.
#[derive(Clone)]
pub struct Memory {
    content: Bytes,
    cached: bool,
    open: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl Memory {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            cached: false,
            open: Arc::new(AtomicBool::new(false)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Expose the content through [Reader::cached].
    pub fn with_cache(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Number of calls to [Reader::read_at].
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    /// The bytes of `content` within `[offset, offset + len)`, truncated at the end.
    fn window(&self, offset: u64, len: usize) -> &[u8] {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.content.len());
        let end = start.saturating_add(len).min(self.content.len());
        &self.content[start..end]
    }
}

impl Reader for Memory {
    fn open(
        &mut self,
        _file: &str,
        _mtime: Option<SystemTime>,
        _cache_handle: bool,
    ) -> Result<(), Error> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        if !self.is_open() {
            return Err(Error::FileClosed);
        }
        self.reads.fetch_add(1, Ordering::AcqRel);
        let window = self.window(offset, buf.len());
        buf[..window.len()].copy_from_slice(window);
        Ok(window.len())
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::Release);
    }

    fn cached(&mut self, offset: u64, len: usize) -> Option<Bytes> {
        if !self.cached {
            return None;
        }
        let window = self.window(offset, len);
        Some(self.content.slice_ref(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_at() {
        let mut reader = Memory::new(&b"hello world"[..]);
        let mut buf = [0u8; 5];
        assert!(matches!(
            reader.read_at(0, &mut buf),
            Err(Error::FileClosed)
        ));

        reader.open("mem", None, false).unwrap();
        assert_eq!(reader.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(reader.read_at(9, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ld");
        assert_eq!(reader.read_at(100, &mut buf).unwrap(), 0);
        assert_eq!(reader.reads(), 3);
    }

    #[test]
    fn test_clones_share_state() {
        let observer = Memory::new(vec![0u8; 8]);
        let mut reader = observer.clone();
        reader.open("mem", None, false).unwrap();
        assert!(observer.is_open());
        reader.close();
        assert!(!observer.is_open());
    }

    #[test]
    fn test_cached() {
        let mut uncached = Memory::new(&b"abcdef"[..]);
        assert!(uncached.cached(0, 6).is_none());

        let mut reader = Memory::new(&b"abcdef"[..]).with_cache();
        assert_eq!(reader.cached(1, 3).unwrap(), Bytes::from_static(b"bcd"));
        // Truncated entries return fewer bytes than requested
        assert_eq!(reader.cached(4, 10).unwrap(), Bytes::from_static(b"ef"));
    }
}
