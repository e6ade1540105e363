//! Local block file reader
//!
//! Reads a block's backing file with positional reads (`pread`), so any
//! number of packet readers can read disjoint or overlapping ranges through
//! one shared reader without seeking or locking.

use blockio_common::{Error, Result};
use parking_lot::RwLock;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read-only handle on a block's backing file
pub struct LocalFileBlockReader {
    file: RwLock<Option<File>>,
    path: PathBuf,
    length: u64,
}

impl LocalFileBlockReader {
    /// Open the backing file of a block
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| {
            Error::Storage(format!("failed to open {}: {}", path.display(), e))
        })?;

        let metadata = file.metadata().map_err(|e| {
            Error::Storage(format!("failed to get metadata for {}: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(Error::Storage(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        #[cfg(target_os = "linux")]
        Self::advise_sequential(&file, &path);

        debug!(path = %path.display(), length = metadata.len(), "opened local block file");

        Ok(Self {
            file: RwLock::new(Some(file)),
            path,
            length: metadata.len(),
        })
    }

    /// Hint the kernel that packets are read front to back
    #[cfg(target_os = "linux")]
    fn advise_sequential(file: &File, path: &Path) {
        use std::os::unix::io::AsRawFd;

        // SAFETY: the descriptor stays valid for the lifetime of `file`.
        let ret =
            unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL) };
        if ret != 0 {
            debug!(path = %path.display(), errno = ret, "posix_fadvise failed");
        }
    }

    /// Size of the backing file when it was opened
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check whether the reader has been closed
    pub fn is_closed(&self) -> bool {
        self.file.read().is_none()
    }

    /// Read up to `buf.len()` bytes starting at `offset`
    ///
    /// Keeps reading until the buffer is full or the file ends, so a short
    /// count always means end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or_else(|| {
            Error::Storage(format!("reader for {} is closed", self.path.display()))
        })?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::Storage(format!(
                        "read failed on {} at offset {}: {}",
                        self.path.display(),
                        offset + filled as u64,
                        e
                    )));
                }
            }
        }
        Ok(filled)
    }

    /// Release the file descriptor
    ///
    /// Idempotent. Reads issued afterwards fail.
    pub fn close(&self) -> Result<()> {
        if self.file.write().take().is_some() {
            debug!(path = %self.path.display(), "closed local block file");
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalFileBlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileBlockReader")
            .field("path", &self.path)
            .field("length", &self.length)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn block_file(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_open_and_read() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let file = block_file(&data);

        let reader = LocalFileBlockReader::open(file.path()).unwrap();
        assert_eq!(reader.length(), 10_000);
        assert_eq!(reader.path(), file.path());

        let mut buf = vec![0u8; 1024];
        assert_eq!(reader.read_at(4000, &mut buf).unwrap(), 1024);
        assert_eq!(buf, &data[4000..5024]);
    }

    #[test]
    fn test_short_read_at_end() {
        let file = block_file(b"0123456789");
        let reader = LocalFileBlockReader::open(file.path()).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at(6, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");
        assert_eq!(reader.read_at(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_open_missing_file() {
        let err = LocalFileBlockReader::open("/nonexistent/blk42").unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_open_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalFileBlockReader::open(dir.path()).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let file = block_file(b"abc");
        let reader = LocalFileBlockReader::open(file.path()).unwrap();
        reader.close().unwrap();
        reader.close().unwrap();
        assert!(reader.is_closed());

        let mut buf = [0u8; 3];
        assert!(reader.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn test_concurrent_range_reads() {
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let file = block_file(&data);
        let reader = Arc::new(LocalFileBlockReader::open(file.path()).unwrap());

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let reader = Arc::clone(&reader);
                std::thread::spawn(move || {
                    let mut buf = vec![0u8; 8 * 1024];
                    let n = reader.read_at(i * 8 * 1024, &mut buf).unwrap();
                    (i, n, buf)
                })
            })
            .collect();

        for handle in handles {
            let (i, n, buf) = handle.join().unwrap();
            let start = (i * 8 * 1024) as usize;
            assert_eq!(n, 8 * 1024);
            assert_eq!(buf, &data[start..start + n]);
        }
    }

    #[test]
    fn test_random_offsets() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let data: Vec<u8> = (0..20_000).map(|_| rng.r#gen()).collect();
        let file = block_file(&data);
        let reader = LocalFileBlockReader::open(file.path()).unwrap();

        for _ in 0..100 {
            let offset = rng.gen_range(0..=data.len());
            let mut buf = vec![0u8; rng.gen_range(0..4096)];
            let n = reader.read_at(offset as u64, &mut buf).unwrap();
            assert_eq!(n, buf.len().min(data.len() - offset));
            assert_eq!(&buf[..n], &data[offset..offset + n]);
        }
    }
}
