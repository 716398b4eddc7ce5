use crate::{reader::Reader, Error};
use std::{fs::File, io::ErrorKind, sync::Arc, time::SystemTime};
use tracing::debug;

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

/// A [Reader] for files on the local filesystem.
///
/// Reads are positioned (they never move a shared cursor). The local filesystem has no
/// read-through cache, so [Reader::cached] always misses.
#[derive(Default)]
pub struct Local {
    file: Option<(String, File)>,
}

impl Local {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

impl Reader for Local {
    fn open(
        &mut self,
        file: &str,
        mtime: Option<SystemTime>,
        _cache_handle: bool,
    ) -> Result<(), Error> {
        if self.file.is_some() {
            return Ok(());
        }
        let handle = File::open(file).map_err(|err| Error::OpenFailed(file.into(), Arc::new(err)))?;
        if let Some(expected) = mtime {
            let modified = handle
                .metadata()
                .and_then(|metadata| metadata.modified())
                .map_err(|err| Error::OpenFailed(file.into(), Arc::new(err)))?;
            if modified != expected {
                return Err(Error::FileModified(file.into()));
            }
        }
        debug!(file = %file, "opened file");
        self.file = Some((file.into(), handle));
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let (name, file) = self.file.as_ref().ok_or(Error::FileClosed)?;
        let mut read = 0;
        while read < buf.len() {
            let position = offset
                .checked_add(read as u64)
                .ok_or(Error::OffsetOverflow)?;
            match read_at(file, &mut buf[read..], position) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::ReadFailed(name.clone(), position, Arc::new(err))),
            }
        }
        Ok(read)
    }

    fn close(&mut self) {
        if let Some((file, _)) = self.file.take() {
            debug!(file = %file, "closed file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{path::PathBuf, time::Duration};

    /// A file in the temporary directory that is removed on drop.
    struct TempFile(PathBuf);

    impl TempFile {
        fn new(name: &str, content: &[u8]) -> Self {
            let path = std::env::temp_dir().join(format!(
                "quarry-io-{}-{}",
                std::process::id(),
                name
            ));
            std::fs::write(&path, content).unwrap();
            Self(path)
        }

        fn path(&self) -> &str {
            self.0.to_str().unwrap()
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_read_and_short_read_at_end() {
        let content: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let file = TempFile::new("short-read", &content);

        let mut reader = Local::new();
        reader.open(file.path(), None, false).unwrap();
        assert!(reader.is_open());

        let mut buf = vec![0u8; 4096];
        assert_eq!(reader.read_at(100, &mut buf).unwrap(), 4096);
        assert_eq!(&buf[..], &content[100..4196]);

        // Only 904 bytes remain after offset 9096
        assert_eq!(reader.read_at(9096, &mut buf).unwrap(), 904);
        assert_eq!(&buf[..904], &content[9096..]);

        // Reading past the end returns nothing
        assert_eq!(reader.read_at(20_000, &mut buf).unwrap(), 0);

        reader.close();
        assert!(!reader.is_open());
        reader.close();
    }

    #[test]
    fn test_open_is_idempotent() {
        let file = TempFile::new("idempotent", b"hello");
        let mut reader = Local::new();
        reader.open(file.path(), None, true).unwrap();
        reader.open(file.path(), None, true).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(reader.read_at(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_missing_file() {
        let mut reader = Local::new();
        let result = reader.open("/nonexistent/quarry-io/file", None, false);
        assert!(matches!(result, Err(Error::OpenFailed(_, _))));
    }

    #[test]
    fn test_mtime_check() {
        let file = TempFile::new("mtime", b"hello");
        let modified = std::fs::metadata(file.path()).unwrap().modified().unwrap();

        let mut reader = Local::new();
        reader.open(file.path(), Some(modified), false).unwrap();
        reader.close();

        let stale = modified - Duration::from_secs(3600);
        let result = reader.open(file.path(), Some(stale), false);
        assert!(matches!(result, Err(Error::FileModified(_))));
        assert!(!reader.is_open());
    }

    #[test]
    fn test_read_when_closed() {
        let mut reader = Local::new();
        let mut buf = [0u8; 1];
        assert!(matches!(
            reader.read_at(0, &mut buf),
            Err(Error::FileClosed)
        ));
    }
}
