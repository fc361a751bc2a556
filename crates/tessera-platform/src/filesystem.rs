//! File System Abstraction
//!
//! Random-access file I/O with async support. A single open handle serves any
//! number of concurrent ranged reads: reads are positional, so there is no shared
//! cursor to race on.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::{PlatformError, PlatformResult};

/// Shared read-only file handle for positional reads
#[derive(Clone)]
pub struct RandomAccessFile {
    path: PathBuf,
    file: Arc<File>,
    len: u64,
    #[cfg(not(any(unix, windows)))]
    cursor: Arc<parking_lot::Mutex<()>>,
}

impl std::fmt::Debug for RandomAccessFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomAccessFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl RandomAccessFile {
    /// Open a file for reading without blocking the calling task
    pub async fn open(path: impl AsRef<Path>) -> PlatformResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        let file = file.into_std().await;

        Ok(Self {
            path,
            file: Arc::new(file),
            len,
            #[cfg(not(any(unix, windows)))]
            cursor: Arc::new(parking_lot::Mutex::new(())),
        })
    }

    /// Open a file for reading on the current thread
    pub fn open_blocking(path: impl AsRef<Path>) -> PlatformResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path,
            file: Arc::new(file),
            len,
            #[cfg(not(any(unix, windows)))]
            cursor: Arc::new(parking_lot::Mutex::new(())),
        })
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes at open time
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Check whether the file was empty at open time
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read exactly `len` bytes starting at `offset` on the current thread
    pub fn read_at_blocking(&self, offset: u64, len: usize) -> PlatformResult<Vec<u8>> {
        let end = offset.checked_add(len as u64).unwrap_or(u64::MAX);
        if end > self.len {
            return Err(PlatformError::OutOfRange {
                offset,
                len,
                file_len: self.len,
            });
        }

        let mut buffer = vec![0u8; len];
        self.fill_at(offset, &mut buffer)?;
        Ok(buffer)
    }

    /// Read exactly `len` bytes starting at `offset` on the blocking pool
    pub async fn read_at(&self, offset: u64, len: usize) -> PlatformResult<Vec<u8>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.read_at_blocking(offset, len))
            .await
            .map_err(|e| PlatformError::TaskFailed(e.to_string()))?
    }

    #[cfg(unix)]
    fn fill_at(&self, offset: u64, buffer: &mut [u8]) -> PlatformResult<()> {
        use std::os::unix::fs::FileExt;

        self.file.read_exact_at(buffer, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn fill_at(&self, offset: u64, buffer: &mut [u8]) -> PlatformResult<()> {
        use std::os::windows::fs::FileExt;

        let mut filled = 0;
        while filled < buffer.len() {
            match self.file.seek_read(&mut buffer[filled..], offset + filled as u64)? {
                0 => return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
                n => filled += n,
            }
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn fill_at(&self, offset: u64, buffer: &mut [u8]) -> PlatformResult<()> {
        use std::io::{Read, Seek, SeekFrom};

        let _guard = self.cursor.lock();
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buffer)?;
        Ok(())
    }
}

/// Async file writer for producing files without blocking
pub struct AsyncFileHandle {
    path: PathBuf,
}

impl AsyncFileHandle {
    /// Create a handle for the given path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create or truncate the file and write every chunk in order
    pub async fn write_chunks<I>(&self, chunks: I) -> PlatformResult<u64>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::File::create(&self.path).await?;
        let mut written = 0u64;
        for chunk in chunks {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(&self.path).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn temp_file(name: &str, contents: &[u8]) -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_blocking_ranged_read() {
        let data: Vec<u8> = (0..=255).collect();
        let (_dir, path) = temp_file("blocking.bin", &data);

        let file = RandomAccessFile::open_blocking(&path).unwrap();
        assert_eq!(file.len(), 256);
        assert_eq!(file.read_at_blocking(16, 4).unwrap(), vec![16, 17, 18, 19]);
    }

    #[test]
    fn test_read_past_end_is_rejected() {
        let (_dir, path) = temp_file("short.bin", &[1, 2, 3]);

        let file = RandomAccessFile::open_blocking(&path).unwrap();
        let result = file.read_at_blocking(2, 4);
        assert!(matches!(result, Err(PlatformError::OutOfRange { offset: 2, len: 4, file_len: 3 })));
    }

    #[tokio::test]
    async fn test_concurrent_async_reads() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let (_dir, path) = temp_file("concurrent.bin", &data);

        let file = RandomAccessFile::open(&path).await.unwrap();
        let reads: Vec<_> = (0..8u64)
            .map(|i| {
                let file = file.clone();
                tokio::spawn(async move { (i, file.read_at(i * 128, 128).await) })
            })
            .collect();

        for read in reads {
            let (i, bytes) = read.await.unwrap();
            let start = (i * 128) as usize;
            assert_eq!(bytes.unwrap(), &data[start..start + 128]);
        }
    }

    #[tokio::test]
    async fn test_write_chunks() {
        let dir = tempdir().unwrap();
        let handle = AsyncFileHandle::new(dir.path().join("chunks.bin"));

        let written = handle.write_chunks(vec![vec![1, 2], vec![3]]).await.unwrap();
        assert_eq!(written, 3);
        assert!(handle.exists().await);
        assert_eq!(std::fs::read(handle.path()).unwrap(), vec![1, 2, 3]);
    }
}
