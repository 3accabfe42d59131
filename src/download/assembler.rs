//! The file assembler: single owner of the partial output file.
//!
//! Workers hand it buffers at absolute offsets; it serializes the writes,
//! tracks fsync checkpoints, and supports renaming the file while it is
//! still open (the rename-on-name-discovery flow). Only the assembler
//! ever mutates the output file.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::constants::SYNC_INTERVAL;
use super::error::DownloadError;

/// Acknowledgement for one accepted write.
#[derive(Debug, Clone, Copy)]
pub struct WriteAck {
    /// `true` when an fsync checkpoint was just taken, meaning every byte
    /// accepted so far is durable and chunk state may be persisted.
    pub synced: bool,
}

/// Owns the writable output file of one download.
///
/// All operations serialize on an internal lock, so concurrent
/// `add_chunk` calls from multiple workers are safe; each call's ack
/// reflects its own data having been accepted.
#[derive(Debug)]
pub struct FileAssembler {
    inner: Mutex<AssemblerInner>,
}

#[derive(Debug)]
struct AssemblerInner {
    file: Option<File>,
    path: PathBuf,
    unsynced: u64,
}

impl FileAssembler {
    /// Opens the assembly file for writing.
    ///
    /// # Errors
    ///
    /// A file locked by another process maps to
    /// [`DownloadError::ProcessCanceled`]; other failures to
    /// [`DownloadError::Io`].
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn create(path: &Path) -> Result<Self, DownloadError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .await
            .map_err(|error| map_open_error(path, error))?;
        debug!("assembly file opened");
        Ok(Self {
            inner: Mutex::new(AssemblerInner {
                file: Some(file),
                path: path.to_path_buf(),
                unsynced: 0,
            }),
        })
    }

    /// Pre-allocates the file to the expected total size.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the allocation fails, or
    /// [`DownloadError::ProcessCanceled`] after `close`.
    pub async fn set_total_size(&self, size: u64) -> Result<(), DownloadError> {
        let mut inner = self.inner.lock().await;
        let path = inner.path.clone();
        let file = open_file(&mut inner)?;
        file.set_len(size)
            .await
            .map_err(|error| DownloadError::io(path, error))
    }

    /// Writes `data` at the absolute `offset`.
    ///
    /// Writes from different workers complete in unspecified order, but
    /// each returned ack covers exactly the bytes passed to that call.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] on write failure, or
    /// [`DownloadError::ProcessCanceled`] after `close`.
    pub async fn add_chunk(&self, offset: u64, data: Bytes) -> Result<WriteAck, DownloadError> {
        let mut inner = self.inner.lock().await;
        let path = inner.path.clone();
        let len = data.len() as u64;

        let file = open_file(&mut inner)?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|error| DownloadError::io(path.clone(), error))?;
        file.write_all(&data)
            .await
            .map_err(|error| DownloadError::io(path.clone(), error))?;

        inner.unsynced += len;
        let synced = inner.unsynced >= SYNC_INTERVAL;
        if synced {
            let file = open_file(&mut inner)?;
            file.sync_data()
                .await
                .map_err(|error| DownloadError::io(path, error))?;
            inner.unsynced = 0;
        }
        Ok(WriteAck { synced })
    }

    /// Renames the assembly file while it stays open for writing.
    ///
    /// Legal only before `close`; the internal lock guarantees no write
    /// is in flight while the rename happens.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ProcessCanceled`] after `close`, or
    /// [`DownloadError::Io`] when the filesystem rename fails.
    #[instrument(skip(self), fields(to = %new_path.display()))]
    pub async fn rename(&self, new_path: &Path) -> Result<(), DownloadError> {
        let mut inner = self.inner.lock().await;
        if inner.file.is_none() {
            return Err(DownloadError::process_canceled("assembler closed"));
        }
        tokio::fs::rename(&inner.path, new_path)
            .await
            .map_err(|error| DownloadError::io(inner.path.clone(), error))?;
        debug!(from = %inner.path.display(), "assembly file renamed");
        inner.path = new_path.to_path_buf();
        Ok(())
    }

    /// Flushes, syncs, and releases the file handle.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the final flush or sync fails.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), DownloadError> {
        let mut inner = self.inner.lock().await;
        if let Some(mut file) = inner.file.take() {
            let path = inner.path.clone();
            file.flush()
                .await
                .map_err(|error| DownloadError::io(path.clone(), error))?;
            file.sync_all()
                .await
                .map_err(|error| DownloadError::io(path, error))?;
            debug!(path = %inner.path.display(), "assembly file closed");
        }
        Ok(())
    }

    /// Whether `close` has already released the handle.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.file.is_none()
    }

    /// The current on-disk path (changes after a successful `rename`).
    pub async fn path(&self) -> PathBuf {
        self.inner.lock().await.path.clone()
    }
}

fn open_file(inner: &mut AssemblerInner) -> Result<&mut File, DownloadError> {
    inner
        .file
        .as_mut()
        .ok_or_else(|| DownloadError::process_canceled("assembler closed"))
}

fn map_open_error(path: &Path, error: std::io::Error) -> DownloadError {
    let locked = error.kind() == std::io::ErrorKind::WouldBlock
        || error.raw_os_error() == Some(libc_ebusy());
    if locked {
        DownloadError::process_canceled(format!("file locked: {}", path.display()))
    } else {
        DownloadError::io(path, error)
    }
}

/// EBUSY without pulling in libc for one constant.
const fn libc_ebusy() -> i32 {
    16
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_out_of_order_writes_assemble_correctly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part.bin");
        let assembler = FileAssembler::create(&path).await.unwrap();

        assembler
            .add_chunk(6, Bytes::from_static(b"world!"))
            .await
            .unwrap();
        assembler
            .add_chunk(0, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        assembler.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world!");
    }

    #[tokio::test]
    async fn test_set_total_size_preallocates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part.bin");
        let assembler = FileAssembler::create(&path).await.unwrap();

        assembler.set_total_size(4096).await.unwrap();
        assembler.close().await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_rename_while_open_keeps_writing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part.bin");
        let renamed = dir.path().join("final.bin");
        let assembler = FileAssembler::create(&path).await.unwrap();

        assembler
            .add_chunk(0, Bytes::from_static(b"before "))
            .await
            .unwrap();
        assembler.rename(&renamed).await.unwrap();
        assembler
            .add_chunk(7, Bytes::from_static(b"after"))
            .await
            .unwrap();
        assembler.close().await.unwrap();

        assert!(!path.exists());
        assert_eq!(std::fs::read(&renamed).unwrap(), b"before after");
        assert_eq!(assembler.path().await, renamed);
    }

    #[tokio::test]
    async fn test_add_chunk_after_close_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part.bin");
        let assembler = FileAssembler::create(&path).await.unwrap();
        assembler.close().await.unwrap();

        let result = assembler.add_chunk(0, Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(DownloadError::ProcessCanceled { .. })));
        assert!(assembler.is_closed().await);
    }

    #[tokio::test]
    async fn test_rename_after_close_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part.bin");
        let assembler = FileAssembler::create(&path).await.unwrap();
        assembler.close().await.unwrap();

        let result = assembler.rename(&dir.path().join("x.bin")).await;
        assert!(matches!(result, Err(DownloadError::ProcessCanceled { .. })));
    }

    #[tokio::test]
    async fn test_sync_checkpoint_reported_after_interval() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part.bin");
        let assembler = FileAssembler::create(&path).await.unwrap();

        let ack = assembler
            .add_chunk(0, Bytes::from(vec![0u8; 1024]))
            .await
            .unwrap();
        assert!(!ack.synced);

        let ack = assembler
            .add_chunk(1024, Bytes::from(vec![0u8; SYNC_INTERVAL as usize]))
            .await
            .unwrap();
        assert!(ack.synced);

        // Counter resets after the checkpoint.
        let ack = assembler
            .add_chunk(0, Bytes::from(vec![0u8; 1024]))
            .await
            .unwrap();
        assert!(!ack.synced);
        assembler.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part.bin");
        let assembler = std::sync::Arc::new(FileAssembler::create(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0u64..16 {
            let assembler = std::sync::Arc::clone(&assembler);
            handles.push(tokio::spawn(async move {
                let payload = vec![u8::try_from(i).unwrap(); 128];
                assembler.add_chunk(i * 128, Bytes::from(payload)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assembler.close().await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 16 * 128);
        for (i, chunk) in contents.chunks(128).enumerate() {
            assert!(chunk.iter().all(|&b| b == u8::try_from(i).unwrap()));
        }
    }
}
