//! The `FileAccessor` collaborator interface (spec §4.8, C10): random-access
//! write/preallocate/flush/delete/size. The real file-accessor
//! implementation is out of scope (spec §1); this module defines the trait
//! the engine depends on, a reference implementation grounded on the
//! donor's `storage::{StorageWriterBuilder, StorageWriter}` (posix_fallocate
//! preallocation, `pwrite`-style concurrent offset writes, atomic
//! temp-to-final rename), and an in-memory test double.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Random-access file operations the engine needs (spec §4.8). The engine
/// assumes concurrent `write_at` calls at non-overlapping offsets are safe,
/// `preallocate` zero-fills or reserves space up to `total_bytes`, and
/// `close` is idempotent.
#[async_trait]
pub trait FileAccessor: Send + Sync {
    async fn preallocate(&self, total_bytes: u64) -> anyhow::Result<()>;
    async fn write_at(&self, offset: u64, bytes: &[u8]) -> anyhow::Result<()>;
    async fn read_at(&self, offset: u64, len: u64) -> anyhow::Result<Vec<u8>>;
    async fn size(&self) -> anyhow::Result<u64>;
    async fn flush(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    async fn delete(&self) -> anyhow::Result<()>;
}

/// Reference `FileAccessor` backed by a real file, directly adapted from the
/// donor's `storage` module: `posix_fallocate` on Unix with a `set_len`
/// fallback, `pwrite` for concurrent offset writes, blocking I/O bridged via
/// `spawn_blocking` since the engine's execution/segment-downloader layers
/// are async.
pub struct StdFileAccessor {
    file: Arc<std::fs::File>,
    path: PathBuf,
}

impl StdFileAccessor {
    /// Creates (or truncates) a file at `path` for a fresh download.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing file for resume (no truncation).
    pub fn open_existing(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::options().read(true).write(true).open(path)?;
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FileAccessor for StdFileAccessor {
    async fn preallocate(&self, total_bytes: u64) -> anyhow::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            #[cfg(unix)]
            {
                use std::os::unix::io::AsRawFd;
                let fd = file.as_raw_fd();
                let r = unsafe { libc::posix_fallocate(fd, 0, total_bytes as libc::off_t) };
                if r == 0 {
                    return Ok(());
                }
                tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
            }
            file.set_len(total_bytes).map_err(anyhow::Error::from)
        })
        .await?
    }

    #[cfg(unix)]
    async fn write_at(&self, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
        let file = Arc::clone(&self.file);
        let data = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let n = file.write_at(&data, offset)?;
            if n != data.len() {
                anyhow::bail!("short write: {} of {}", n, data.len());
            }
            Ok(())
        })
        .await?
    }

    #[cfg(not(unix))]
    async fn write_at(&self, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let file = Arc::clone(&self.file);
        let data = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut f = (*file).try_clone()?;
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(&data)?;
            Ok(())
        })
        .await?
    }

    #[cfg(unix)]
    async fn read_at(&self, offset: u64, len: u64) -> anyhow::Result<Vec<u8>> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len as usize];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await?
    }

    #[cfg(not(unix))]
    async fn read_at(&self, offset: u64, len: u64) -> anyhow::Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut f = (*file).try_clone()?;
            f.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len as usize];
            f.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await?
    }

    async fn size(&self) -> anyhow::Result<u64> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || Ok(file.metadata()?.len())).await?
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_all().map_err(anyhow::Error::from)).await?
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Idempotent: dropping `Arc<File>` clones elsewhere still leaves the
        // underlying fd open until every handle is dropped. This accessor
        // has no separate "closed" state to track.
        Ok(())
    }

    async fn delete(&self) -> anyhow::Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e)),
        })
        .await?
    }
}

/// Creates the `FileAccessor` for a task's output path (spec §4.4.3: "create
/// file accessor"). A factory rather than a bare constructor because
/// execution needs to create-fresh on the first attempt and open-existing on
/// resume, and because tests substitute an in-memory factory for the real
/// filesystem.
#[async_trait]
pub trait FileAccessorFactory: Send + Sync {
    async fn create(&self, path: &Path) -> anyhow::Result<Arc<dyn FileAccessor>>;
    async fn open_existing(&self, path: &Path) -> anyhow::Result<Arc<dyn FileAccessor>>;
}

/// Reference factory producing [`StdFileAccessor`]s, bridging the blocking
/// `std::fs::File` open through `spawn_blocking`.
pub struct StdFileAccessorFactory;

#[async_trait]
impl FileAccessorFactory for StdFileAccessorFactory {
    async fn create(&self, path: &Path) -> anyhow::Result<Arc<dyn FileAccessor>> {
        let path = path.to_path_buf();
        let accessor = tokio::task::spawn_blocking(move || StdFileAccessor::create(&path)).await??;
        Ok(Arc::new(accessor))
    }

    async fn open_existing(&self, path: &Path) -> anyhow::Result<Arc<dyn FileAccessor>> {
        let path = path.to_path_buf();
        let accessor = tokio::task::spawn_blocking(move || StdFileAccessor::open_existing(&path)).await??;
        Ok(Arc::new(accessor))
    }
}

/// In-memory `FileAccessor` used by unit/integration tests in place of the
/// out-of-scope real collaborator.
#[derive(Clone, Default)]
pub struct InMemoryFileAccessor {
    data: Arc<tokio::sync::Mutex<Vec<u8>>>,
    deleted: Arc<std::sync::atomic::AtomicBool>,
}

impl InMemoryFileAccessor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileAccessor for InMemoryFileAccessor {
    async fn preallocate(&self, total_bytes: u64) -> anyhow::Result<()> {
        let mut data = self.data.lock().await;
        data.resize(total_bytes as usize, 0);
        Ok(())
    }

    async fn write_at(&self, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
        let mut data = self.data.lock().await;
        let end = offset as usize + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    async fn read_at(&self, offset: u64, len: u64) -> anyhow::Result<Vec<u8>> {
        let data = self.data.lock().await;
        let start = offset as usize;
        let end = start + len as usize;
        anyhow::ensure!(end <= data.len(), "read_at out of bounds");
        Ok(data[start..end].to_vec())
    }

    async fn size(&self) -> anyhow::Result<u64> {
        Ok(self.data.lock().await.len() as u64)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete(&self) -> anyhow::Result<()> {
        self.deleted.store(true, std::sync::atomic::Ordering::SeqCst);
        self.data.lock().await.clear();
        Ok(())
    }
}
