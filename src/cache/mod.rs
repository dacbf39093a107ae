use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::keyed_mutex::KeyedMutex;
use crate::meta::MetaStore;
use crate::remote::{Remote, RemoteError};
use crate::sync::UploadQueue;
use crate::types::{ObjectId, Upload};

#[derive(Debug, Error)]
pub enum CacheError {
    /// Write through a reference opened read-only.
    #[error("reference is read-only")]
    ReadOnly,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Other(err.into())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// The staging file shared by every open reference to one path.
pub struct WorkingCopy {
    file: File,
    disk_path: PathBuf,
    id: ObjectId,
    /// Serialises writes so interleaved `write_at` calls cannot corrupt the
    /// kernel's view of ordering.
    write_lock: Mutex<()>,
}

struct CacheEntry {
    copy: Arc<WorkingCopy>,
    count: usize,
    dirty: bool,
    fetched: bool,
}

/// Copies remote files to local disk while they are open and re-uploads
/// them once every client has released them.
///
/// Each path has at most one working copy; concurrent opens share it and
/// therefore observe each other's writes. The per-path lock is held across
/// open and release so a release that drops the refcount to zero cannot race
/// a new open of the same path.
pub struct WriteCache {
    remote: Arc<dyn Remote>,
    meta: Arc<MetaStore>,
    queue: Arc<UploadQueue>,
    staging_dir: PathBuf,
    files: Mutex<HashMap<String, CacheEntry>>,
    locks: KeyedMutex,
    next_staging: AtomicU64,
}

impl WriteCache {
    pub fn new(
        remote: Arc<dyn Remote>,
        meta: Arc<MetaStore>,
        queue: Arc<UploadQueue>,
        staging_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(WriteCache {
            remote,
            meta,
            queue,
            staging_dir,
            files: Mutex::new(HashMap::new()),
            locks: KeyedMutex::new(),
            next_staging: AtomicU64::new(1),
        })
    }

    /// Opens a reference to the working copy for `path`, creating an empty
    /// staging file on first open. The remote content is fetched lazily:
    /// some applications open a file and never read or write.
    pub async fn open(
        self: Arc<Self>,
        path: &str,
        id: &ObjectId,
        is_reader: bool,
    ) -> CacheResult<FileReference> {
        let _guard = self.locks.lock(path).await;

        let copy = {
            let mut files = self.files.lock();
            if let Some(entry) = files.get_mut(path) {
                entry.count += 1;
                debug!(path, count = entry.count, "joining open working copy");
                Arc::clone(&entry.copy)
            } else {
                let seq = self.next_staging.fetch_add(1, Ordering::Relaxed);
                let disk_path = self.staging_dir.join(format!("wc-{}", seq));
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(&disk_path)
                    .with_context(|| {
                        format!("failed to create staging file {}", disk_path.display())
                    })?;
                debug!(path, staging = %disk_path.display(), "new working copy");
                let copy = Arc::new(WorkingCopy {
                    file,
                    disk_path,
                    id: id.clone(),
                    write_lock: Mutex::new(()),
                });
                files.insert(
                    path.to_owned(),
                    CacheEntry {
                        copy: Arc::clone(&copy),
                        count: 1,
                        dirty: false,
                        fetched: false,
                    },
                );
                copy
            }
        };

        drop(_guard);
        Ok(FileReference {
            cache: self,
            path: path.to_owned(),
            copy,
            is_reader,
        })
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    fn mark_dirty(&self, path: &str) {
        let mut files = self.files.lock();
        let entry = files
            .get_mut(path)
            .expect("dirty mark for a path with no working copy");
        if !entry.dirty {
            debug!(path, "marking working copy dirty");
        }
        entry.dirty = true;
    }

    /// Populates the working copy from the remote the first time content is
    /// needed. Freshly created files (empty-id sentinel) have nothing to
    /// fetch.
    async fn ensure_local(&self, path: &str, copy: &WorkingCopy) -> CacheResult<()> {
        let _guard = self.locks.lock(path).await;

        let fetched = {
            let files = self.files.lock();
            files
                .get(path)
                .expect("ensure_local for a path with no working copy")
                .fetched
        };
        if fetched {
            return Ok(());
        }

        if !copy.id.is_empty_sentinel() {
            debug!(path, id = ?copy.id, "fetching remote content into working copy");
            let mut stream = self.remote.read_all(&copy.id).await?;
            let mut offset = 0_u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                copy.file
                    .write_all_at(&chunk, offset)
                    .context("failed to write fetched content")?;
                offset += chunk.len() as u64;
            }
        }

        self.files
            .lock()
            .get_mut(path)
            .expect("ensure_local entry vanished")
            .fetched = true;
        Ok(())
    }

    /// Drops one reference. When the last reference goes and the copy is
    /// dirty, the staging content is snapshotted and handed to the upload
    /// queue; the upload itself runs on the worker after the per-path lock
    /// is released.
    async fn release(&self, path: &str, copy: &Arc<WorkingCopy>) -> CacheResult<()> {
        let _guard = self.locks.lock(path).await;

        let (count, dirty) = {
            let mut files = self.files.lock();
            let entry = files
                .get_mut(path)
                .expect("release for a path with no working copy");
            entry.count -= 1;
            let snapshot = (entry.count, entry.dirty);
            if entry.count == 0 {
                files.remove(path);
            }
            snapshot
        };

        if count > 0 {
            debug!(path, count, "working copy still referenced");
            return Ok(());
        }

        if dirty {
            let seq = self.next_staging.fetch_add(1, Ordering::Relaxed);
            let upload_path = self.staging_dir.join(format!("up-{}", seq));
            tokio::fs::copy(&copy.disk_path, &upload_path)
                .await
                .context("failed to snapshot working copy for upload")?;
            let size = tokio::fs::metadata(&copy.disk_path)
                .await
                .context("failed to stat working copy")?
                .len();

            self.queue
                .enqueue(Upload {
                    id: copy.id.clone(),
                    local_path: upload_path.to_string_lossy().into_owned(),
                    path: path.to_owned(),
                })
                .await?;
            self.meta
                .set_size(path, size)
                .await
                .map_err(|err| CacheError::Other(err.into()))?;
        }

        debug!(path, staging = %copy.disk_path.display(), "removing working copy");
        if let Err(err) = tokio::fs::remove_file(&copy.disk_path).await {
            warn!(path, error = %err, "failed to remove staging file");
        }
        Ok(())
    }
}

/// One open file backed by a shared working copy.
pub struct FileReference {
    cache: Arc<WriteCache>,
    path: String,
    copy: Arc<WorkingCopy>,
    is_reader: bool,
}

impl FileReference {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_reader(&self) -> bool {
        self.is_reader
    }

    /// Reads up to `size` bytes at `offset` from the working copy, fetching
    /// the remote content first if this is the first access.
    pub async fn read_at(&self, offset: u64, size: u32) -> CacheResult<Vec<u8>> {
        self.cache.ensure_local(&self.path, &self.copy).await?;

        let mut buf = vec![0_u8; size as usize];
        let mut filled = 0_usize;
        while filled < buf.len() {
            let n = self
                .copy
                .file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .context("failed to read working copy")?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Writes at `offset` and marks the copy dirty. References opened
    /// read-only may not write.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> CacheResult<usize> {
        if self.is_reader {
            return Err(CacheError::ReadOnly);
        }
        self.cache.ensure_local(&self.path, &self.copy).await?;

        {
            let _io = self.copy.write_lock.lock();
            self.copy
                .file
                .write_all_at(data, offset)
                .context("failed to write working copy")?;
        }
        self.cache.mark_dirty(&self.path);
        Ok(data.len())
    }

    pub async fn truncate(&self, size: u64) -> CacheResult<()> {
        if self.is_reader {
            return Err(CacheError::ReadOnly);
        }
        // Truncating to zero discards the remote content wholesale, so
        // fetching it first would be wasted work; anything else still needs
        // the original bytes.
        if size > 0 {
            self.cache.ensure_local(&self.path, &self.copy).await?;
        } else {
            let _guard = self.cache.locks.lock(&self.path).await;
            let mut files = self.cache.files.lock();
            if let Some(entry) = files.get_mut(&self.path) {
                entry.fetched = true;
            }
        }
        {
            let _io = self.copy.write_lock.lock();
            self.copy
                .file
                .set_len(size)
                .context("failed to truncate working copy")?;
        }
        self.cache.mark_dirty(&self.path);
        Ok(())
    }

    pub fn fsync(&self) -> CacheResult<()> {
        self.copy
            .file
            .sync_data()
            .context("failed to sync working copy")?;
        Ok(())
    }

    /// Explicitly releases this reference. The last release of a dirty copy
    /// enqueues the upload.
    pub async fn release(self) -> CacheResult<()> {
        self.cache.release(&self.path, &self.copy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use crate::types::Attributes;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        meta: Arc<MetaStore>,
        remote: Arc<MockRemote>,
        queue: Arc<UploadQueue>,
        cache: Arc<WriteCache>,
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let meta = Arc::new(MetaStore::open(&dir.path().join("drive.db")).await.unwrap());
        let remote = Arc::new(MockRemote::new());
        let queue = UploadQueue::start(Arc::clone(&meta), remote.clone()).unwrap();
        let cache = WriteCache::new(remote.clone(), Arc::clone(&meta), Arc::clone(&queue), staging);
        Fixture {
            _dir: dir,
            meta,
            remote,
            queue,
            cache,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn remote_file_attrs(id: &ObjectId, size: u64) -> Attributes {
        Attributes {
            id: id.clone(),
            size,
            is_regular_file: true,
            mode: 0o644,
            has_content: false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_opens_share_working_copy() {
        let fx = setup().await;
        fx.meta
            .set_attrs("f", &remote_file_attrs(&ObjectId::empty(), 0))
            .await
            .unwrap();

        let writer = fx.cache.clone().open("f", &ObjectId::empty(), false).await.unwrap();
        let reader = fx.cache.clone().open("f", &ObjectId::empty(), true).await.unwrap();

        writer.write_at(0, b"shared bytes").await.unwrap();
        // The reader observes the writer's bytes through the same copy.
        assert_eq!(reader.read_at(0, 64).await.unwrap(), b"shared bytes");

        writer.release().await.unwrap();
        assert!(fx.cache.is_open("f"));
        reader.release().await.unwrap();
        assert!(!fx.cache.is_open("f"));

        fx.queue.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_only_reference_cannot_write() {
        let fx = setup().await;
        let reference = fx.cache.clone().open("f", &ObjectId::empty(), true).await.unwrap();
        assert!(matches!(
            reference.write_at(0, b"nope").await,
            Err(CacheError::ReadOnly)
        ));
        assert!(matches!(
            reference.truncate(0).await,
            Err(CacheError::ReadOnly)
        ));
        reference.release().await.unwrap();
        fx.queue.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lazy_fetch_populates_from_remote() {
        let fx = setup().await;
        let id = fx.remote.insert_object(b"remote payload".to_vec());
        fx.meta
            .set_attrs("f", &remote_file_attrs(&id, 14))
            .await
            .unwrap();

        let reference = fx.cache.clone().open("f", &id, false).await.unwrap();
        assert_eq!(fx.remote.read_at_calls(), 0);

        let data = reference.read_at(0, 1024).await.unwrap();
        assert_eq!(data, b"remote payload");

        // Second read reuses the populated copy.
        let again = reference.read_at(7, 7).await.unwrap();
        assert_eq!(again, b"payload");

        reference.release().await.unwrap();
        fx.queue.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn last_release_uploads_once() {
        let fx = setup().await;
        let id = fx.remote.insert_object(b"old".to_vec());
        fx.meta
            .set_attrs("f", &remote_file_attrs(&id, 3))
            .await
            .unwrap();

        let a = fx.cache.clone().open("f", &id, false).await.unwrap();
        let b = fx.cache.clone().open("f", &id, false).await.unwrap();
        a.write_at(0, b"updated!").await.unwrap();

        a.release().await.unwrap();
        // Still open through `b`: nothing uploaded yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.remote.update_calls(), 0);

        b.release().await.unwrap();
        {
            let remote = fx.remote.clone();
            let id = id.clone();
            wait_for(move || remote.object(&id) == Some(b"updated!".to_vec())).await;
        }
        assert_eq!(fx.remote.update_calls(), 1);
        assert_eq!(fx.meta.get_attrs("f").unwrap().size, 8);

        fx.queue.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clean_release_does_not_upload() {
        let fx = setup().await;
        let id = fx.remote.insert_object(b"content".to_vec());
        fx.meta
            .set_attrs("f", &remote_file_attrs(&id, 7))
            .await
            .unwrap();

        let reference = fx.cache.clone().open("f", &id, true).await.unwrap();
        let _ = reference.read_at(0, 7).await.unwrap();
        reference.release().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.remote.update_calls(), 0);
        assert_eq!(fx.remote.create_calls(), 0);

        fx.queue.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_flow_uploads_new_object_and_sets_id() {
        let fx = setup().await;
        fx.meta
            .set_attrs("new.bin", &remote_file_attrs(&ObjectId::empty(), 0))
            .await
            .unwrap();

        let reference = fx
            .cache
            .clone()
            .open("new.bin", &ObjectId::empty(), false)
            .await
            .unwrap();
        reference.write_at(0, b"fresh object").await.unwrap();
        reference.release().await.unwrap();

        {
            let meta = Arc::clone(&fx.meta);
            wait_for(move || !meta.get_attrs("new.bin").unwrap().id.is_empty_sentinel()).await;
        }
        let attrs = fx.meta.get_attrs("new.bin").unwrap();
        assert_eq!(attrs.size, 12);
        assert_eq!(fx.remote.object(&attrs.id), Some(b"fresh object".to_vec()));

        fx.queue.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn staging_files_are_removed_after_release() {
        let fx = setup().await;
        let reference = fx.cache.clone().open("f", &ObjectId::empty(), false).await.unwrap();
        let staging = reference.copy.disk_path.clone();
        assert!(staging.exists());
        reference.release().await.unwrap();
        assert!(!staging.exists());
        fx.queue.shutdown().await.unwrap();
    }
}
