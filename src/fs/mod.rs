mod handle;
mod inode;
mod utils;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use fuse3::raw::prelude::*;
use fuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use fuse3::raw::{Filesystem, MountHandle};
use fuse3::{MountOptions, Result as FuseResult, SetAttr};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::cache::WriteCache;
use crate::config::Config;
use crate::meta::{MetaError, MetaStore};
use crate::reader::RangedReader;
use crate::remote::Remote;
use crate::sync::UploadQueue;
use crate::types::{basename, join_path, Attributes, ObjectId};

use handle::{OpenHandle, RangedHandle};
pub use inode::ROOT_INODE;
use inode::InodeTable;
use utils::{
    attrs_to_file_attr, errno, is_read_only, map_cache_error, map_meta_error,
    map_meta_read_error, map_remote_error, root_attr, wants_truncate, ATTR_TTL,
};

/// `fuse_open_out` flag asking the kernel to bypass the page cache for this
/// open, so reads reach us in issue order.
const FOPEN_DIRECT_IO: u32 = 1 << 0;

/// Advertised to statfs; a large block size coaxes the kernel into issuing
/// larger reads.
const STATFS_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

const MAX_WRITE_BYTES: u32 = 1024 * 1024;

/// How long release waits for in-flight operations on the same handle.
const HANDLE_DRAIN_INTERVAL: Duration = Duration::from_millis(10);
const HANDLE_DRAIN_ATTEMPTS: u32 = 100;

/// The filesystem front-end: translates FUSE upcalls into operations on the
/// metadata store, the write cache, the ranged readers and the upload queue.
#[derive(Clone)]
pub struct DriveFs {
    core: Arc<FsCore>,
}

struct FsCore {
    config: Config,
    meta: Arc<MetaStore>,
    remote: Arc<dyn Remote>,
    cache: Arc<WriteCache>,
    queue: Arc<UploadQueue>,
    inodes: InodeTable,
    handles: Mutex<HashMap<u64, OpenHandle>>,
    next_handle: AtomicU64,
    shutdown_started: AtomicBool,
}

impl DriveFs {
    pub fn new(
        config: Config,
        meta: Arc<MetaStore>,
        remote: Arc<dyn Remote>,
        cache: Arc<WriteCache>,
        queue: Arc<UploadQueue>,
    ) -> Self {
        DriveFs {
            core: Arc::new(FsCore {
                config,
                meta,
                remote,
                cache,
                queue,
                inodes: InodeTable::new(),
                handles: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                shutdown_started: AtomicBool::new(false),
            }),
        }
    }

    /// Mounts at the configured mount point and returns the session handle.
    pub async fn mount(self) -> Result<MountHandle> {
        let mut options = MountOptions::default();
        options
            .fs_name("drivefs")
            .allow_other(self.core.config.allow_other)
            .force_readdir_plus(false);

        let mount_point = self.core.config.mount_point.clone();
        let handle = fuse3::raw::Session::new(options)
            .mount_with_unprivileged(self, mount_point.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to mount at {} (is the mount point already in use?)",
                    mount_point.display()
                )
            })?;
        Ok(handle)
    }

    /// Drains the upload worker and closes the metadata store. The worker is
    /// joined before the store goes away.
    pub async fn graceful_shutdown(&self) -> Result<()> {
        if self.core.shutdown_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.queue.shutdown().await?;
        self.core.meta.close().await?;
        Ok(())
    }
}

impl FsCore {
    fn new_handle(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, handle);
        fh
    }

    fn handle(&self, fh: u64) -> FuseResult<OpenHandle> {
        self.handles
            .lock()
            .get(&fh)
            .cloned()
            .ok_or_else(|| errno(libc::EBADF))
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path_of(ino).ok_or_else(|| errno(libc::ENOENT))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str().ok_or_else(|| errno(libc::EINVAL))?;
        Ok(join_path(&parent_path, name))
    }

    fn is_inline_path(&self, path: &str) -> bool {
        basename(path).ends_with(&self.config.inline_suffix)
    }

    fn entry_reply(&self, path: &str, attrs: &Attributes) -> ReplyEntry {
        let ino = self.inodes.get_or_create(path);
        ReplyEntry {
            ttl: ATTR_TTL,
            attr: attrs_to_file_attr(ino, attrs),
            generation: 0,
        }
    }

    /// Truncates a remote-backed file through the write cache. Joining an
    /// existing working copy keeps the change visible to other open
    /// references; the upload happens on the final release.
    async fn truncate_remote(&self, path: &str, attrs: &Attributes, size: u64) -> FuseResult<()> {
        if size > 0 && !self.cache.is_open(path) {
            // Shrinking or growing a remote object in place is not
            // supported; only a full rewrite through an open file is.
            return Err(errno(libc::ENOSYS));
        }
        let reference = self
            .cache
            .clone()
            .open(path, &attrs.id, false)
            .await
            .map_err(map_cache_error)?;
        let result = reference.truncate(size).await.map_err(map_cache_error);
        let release = reference.release().await.map_err(map_cache_error);
        result.and(release)
    }
}

impl Filesystem for DriveFs {
    type DirEntryStream<'a>
        = BoxStream<'a, FuseResult<DirectoryEntry>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = BoxStream<'a, FuseResult<DirectoryEntryPlus>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        info!("filesystem initialised");
        Ok(ReplyInit {
            max_write: NonZeroU32::new(MAX_WRITE_BYTES).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        debug!("filesystem destroyed");
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.core.child_path(parent, name)?;
        trace!(path = %path, "lookup");

        let attrs = self.core.meta.get_attrs(&path).map_err(map_meta_read_error)?;
        Ok(self.core.entry_reply(&path, &attrs))
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn getattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.core.path_of(inode)?;
        trace!(path = %path, "getattr");

        if path.is_empty() {
            return Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr: root_attr(inode),
            });
        }

        let attrs = self.core.meta.get_attrs(&path).map_err(map_meta_read_error)?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: attrs_to_file_attr(inode, &attrs),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        inode: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.core.path_of(inode)?;
        debug!(path = %path, "setattr");
        if path.is_empty() {
            return Err(errno(libc::EPERM));
        }

        if let Some(mode) = set_attr.mode {
            self.core
                .meta
                .set_mode(&path, mode & 0o7777)
                .await
                .map_err(map_meta_error)?;
        }

        if let Some(size) = set_attr.size {
            let attrs = self.core.meta.get_attrs(&path).map_err(map_meta_error)?;
            if !attrs.is_regular_file {
                return Err(errno(libc::EISDIR));
            }
            if attrs.has_content {
                self.core
                    .meta
                    .truncate_file(&path, size)
                    .await
                    .map_err(map_meta_error)?;
            } else if let Some(OpenHandle::Cached(reference)) =
                fh.and_then(|fh| self.core.handle(fh).ok())
            {
                reference.truncate(size).await.map_err(map_cache_error)?;
            } else {
                self.core.truncate_remote(&path, &attrs, size).await?;
            }
        }

        let attrs = self.core.meta.get_attrs(&path).map_err(map_meta_read_error)?;
        let mut attr = attrs_to_file_attr(inode, &attrs);
        if let Some(size) = set_attr.size {
            // A truncate through an open working copy is recorded in the
            // store only at the final release; reply with the applied size.
            attr.size = size;
        }
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.core.child_path(parent, name)?;
        debug!(path = %path, mode, "mkdir");

        // Directories never touch the remote: the remote is a flat id
        // store, hierarchy lives in paths.
        let attrs = Attributes {
            id: ObjectId::generate_local(),
            size: 0,
            is_regular_file: false,
            mode: mode & 0o7777,
            has_content: false,
        };
        self.core
            .meta
            .insert_attrs(&path, &attrs)
            .await
            .map_err(map_meta_error)?;
        Ok(self.core.entry_reply(&path, &attrs))
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.core.child_path(parent, name)?;
        debug!(path = %path, "unlink");

        let attrs = self
            .core
            .meta
            .get_and_delete_attrs(&path)
            .await
            .map_err(map_meta_error)?;
        self.core.inodes.remove_path(&path);

        if attrs.has_content {
            self.core
                .meta
                .remove_file(&path)
                .await
                .map_err(map_meta_error)?;
        } else if !attrs.id.is_empty_sentinel() {
            // Local metadata is already gone; a remote failure is reported
            // but cannot resurrect the entry.
            if let Err(err) = self.core.remote.delete(&attrs.id).await {
                error!(path = %path, error = %err, "remote delete failed");
                return Err(map_remote_error(err));
            }
        }
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.core.child_path(parent, name)?;
        debug!(path = %path, "rmdir");

        let attrs = self.core.meta.get_attrs(&path).map_err(map_meta_error)?;
        if attrs.is_regular_file {
            return Err(errno(libc::ENOTDIR));
        }
        let empty = self
            .core
            .meta
            .is_directory_empty(&path)
            .map_err(map_meta_error)?;
        if !empty {
            return Err(errno(libc::ENOTEMPTY));
        }

        self.core
            .meta
            .get_and_delete_attrs(&path)
            .await
            .map_err(map_meta_error)?;
        self.core.inodes.remove_path(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.core.child_path(parent, name)?;
        let new = self.core.child_path(new_parent, new_name)?;
        debug!(old = %old, new = %new, "rename");

        self.core.meta.rename(&old, &new).await.map_err(|err| match err {
            MetaError::DoesNotExist => errno(libc::ENOENT),
            MetaError::AlreadyExists => errno(libc::EINVAL),
            MetaError::Store(_) => errno(libc::EIO),
        })?;
        self.core.inodes.rename_prefix(&old, &new);
        Ok(())
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.core.path_of(inode)?;
        debug!(path = %path, flags, "open");

        let attrs = self.core.meta.get_attrs(&path).map_err(map_meta_read_error)?;
        if !attrs.is_regular_file {
            return Err(errno(libc::EISDIR));
        }

        // Inline files run through the kernel page cache; everything
        // remote-backed is direct-io so reads arrive in issue order.
        if attrs.has_content {
            let fh = self.core.new_handle(OpenHandle::Inline { path });
            return Ok(ReplyOpen { fh, flags: 0 });
        }

        let read_only = is_read_only(flags);
        if read_only && !self.core.cache.is_open(&path) {
            let reader = RangedReader::new(
                Arc::clone(&self.core.remote),
                attrs.id.clone(),
                attrs.size,
            );
            let fh = self
                .core
                .new_handle(OpenHandle::Ranged(Arc::new(RangedHandle::new(reader))));
            return Ok(ReplyOpen {
                fh,
                flags: FOPEN_DIRECT_IO,
            });
        }

        let reference = self
            .core
            .cache
            .clone()
            .open(&path, &attrs.id, read_only)
            .await
            .map_err(map_cache_error)?;
        if !read_only && wants_truncate(flags) {
            reference.truncate(0).await.map_err(map_cache_error)?;
        }
        let fh = self.core.new_handle(OpenHandle::Cached(Arc::new(reference)));
        Ok(ReplyOpen {
            fh,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.core.child_path(parent, name)?;
        debug!(path = %path, mode, flags, "create");

        if self.core.is_inline_path(&path) {
            let attrs = Attributes {
                id: ObjectId::generate_local(),
                size: 0,
                is_regular_file: true,
                mode: mode & 0o7777,
                has_content: true,
            };
            self.core
                .meta
                .insert_attrs(&path, &attrs)
                .await
                .map_err(|err| match err {
                    MetaError::AlreadyExists => errno(libc::EINVAL),
                    other => map_meta_error(other),
                })?;
            self.core
                .meta
                .put_file(&path, Vec::new())
                .await
                .map_err(map_meta_error)?;

            let ino = self.core.inodes.get_or_create(&path);
            let fh = self.core.new_handle(OpenHandle::Inline { path });
            return Ok(ReplyCreated {
                ttl: ATTR_TTL,
                attr: attrs_to_file_attr(ino, &attrs),
                generation: 0,
                fh,
                flags: 0,
            });
        }

        // Remote-backed create: the record carries the empty-id sentinel
        // until the first upload completes and assigns a real id.
        let attrs = Attributes {
            id: ObjectId::empty(),
            size: 0,
            is_regular_file: true,
            mode: mode & 0o7777,
            has_content: false,
        };
        self.core
            .meta
            .insert_attrs(&path, &attrs)
            .await
            .map_err(|err| match err {
                MetaError::AlreadyExists => errno(libc::EINVAL),
                other => map_meta_error(other),
            })?;

        let reference = self
            .core
            .cache
            .clone()
            .open(&path, &attrs.id, false)
            .await
            .map_err(map_cache_error)?;
        let ino = self.core.inodes.get_or_create(&path);
        let fh = self.core.new_handle(OpenHandle::Cached(Arc::new(reference)));
        Ok(ReplyCreated {
            ttl: ATTR_TTL,
            attr: attrs_to_file_attr(ino, &attrs),
            generation: 0,
            fh,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn read(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        trace!(inode, fh, offset, size, "read");

        match self.core.handle(fh)? {
            OpenHandle::Inline { path } => {
                let content = self
                    .core
                    .meta
                    .get_file(&path)
                    .map_err(map_meta_error)?
                    .ok_or_else(|| errno(libc::ENOENT))?;
                let offset = offset as usize;
                if offset >= content.len() {
                    return Ok(ReplyData { data: Bytes::new() });
                }
                let end = (offset + size as usize).min(content.len());
                Ok(ReplyData {
                    data: Bytes::copy_from_slice(&content[offset..end]),
                })
            }
            OpenHandle::Cached(reference) => {
                let data = reference
                    .read_at(offset, size)
                    .await
                    .map_err(map_cache_error)?;
                Ok(ReplyData {
                    data: Bytes::from(data),
                })
            }
            OpenHandle::Ranged(handle) => {
                let data = handle
                    .read(offset, size)
                    .await
                    .map_err(map_remote_error)?;
                Ok(ReplyData { data })
            }
        }
    }

    async fn write(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        trace!(inode, fh, offset, len = data.len(), "write");

        match self.core.handle(fh)? {
            OpenHandle::Inline { path } => {
                let written = self
                    .core
                    .meta
                    .write_file(&path, offset, data)
                    .await
                    .map_err(map_meta_error)?;
                Ok(ReplyWrite {
                    written: written as u32,
                })
            }
            OpenHandle::Cached(reference) => {
                let written = reference
                    .write_at(offset, data)
                    .await
                    .map_err(map_cache_error)?;
                Ok(ReplyWrite {
                    written: written as u32,
                })
            }
            OpenHandle::Ranged(_) => Err(errno(libc::EPERM)),
        }
    }

    async fn flush(&self, _req: Request, inode: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        trace!(inode, fh, "flush");
        Ok(())
    }

    async fn fsync(&self, _req: Request, inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        trace!(inode, fh, "fsync");
        if let OpenHandle::Cached(reference) = self.core.handle(fh)? {
            reference.fsync().map_err(map_cache_error)?;
        }
        Ok(())
    }

    async fn release(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        debug!(inode, fh, "release");

        let handle = self
            .core
            .handles
            .lock()
            .remove(&fh)
            .ok_or_else(|| errno(libc::EBADF))?;

        match handle {
            OpenHandle::Inline { .. } | OpenHandle::Ranged(_) => Ok(()),
            OpenHandle::Cached(mut reference) => {
                // In-flight reads or writes may still hold the reference for
                // a moment; wait for them to drain before releasing.
                let mut attempts = 0;
                let reference = loop {
                    match Arc::try_unwrap(reference) {
                        Ok(reference) => break reference,
                        Err(shared) => {
                            attempts += 1;
                            if attempts > HANDLE_DRAIN_ATTEMPTS {
                                error!(fh, "file handle still busy at release");
                                return Err(errno(libc::EIO));
                            }
                            reference = shared;
                            tokio::time::sleep(HANDLE_DRAIN_INTERVAL).await;
                        }
                    }
                };
                reference.release().await.map_err(map_cache_error)
            }
        }
    }

    async fn opendir(&self, _req: Request, inode: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.core.path_of(inode)?;
        trace!(path = %path, "opendir");

        if !path.is_empty() {
            let attrs = self.core.meta.get_attrs(&path).map_err(map_meta_read_error)?;
            if attrs.is_regular_file {
                return Err(errno(libc::ENOTDIR));
            }
        }
        let fh = self.core.next_handle.fetch_add(1, Ordering::Relaxed);
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn readdir(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'_>>> {
        let path = self.core.path_of(inode)?;
        trace!(path = %path, offset, "readdir");

        let listing = self.core.meta.list(&path).map_err(map_meta_read_error)?;

        let mut entries: Vec<DirectoryEntry> = Vec::with_capacity(listing.len() + 2);
        entries.push(DirectoryEntry {
            inode,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        let parent_ino = match path.rfind('/') {
            Some(idx) => self.core.inodes.get_or_create(&path[..idx]),
            None => ROOT_INODE,
        };
        entries.push(DirectoryEntry {
            inode: parent_ino,
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });

        let mut next_offset = 3_i64;
        for entry in listing {
            let child_path = join_path(&path, &entry.name);
            let kind = if entry.attributes.is_regular_file {
                FileType::RegularFile
            } else {
                FileType::Directory
            };
            entries.push(DirectoryEntry {
                inode: self.core.inodes.get_or_create(&child_path),
                kind,
                name: OsString::from(entry.name),
                offset: next_offset,
            });
            next_offset += 1;
        }

        let entries: Vec<_> = entries.into_iter().skip(offset as usize).map(Ok).collect();
        Ok(ReplyDirectory {
            entries: stream::iter(entries).boxed(),
        })
    }

    async fn releasedir(&self, _req: Request, inode: u64, fh: u64, _flags: u32) -> FuseResult<()> {
        trace!(inode, fh, "releasedir");
        Ok(())
    }

    async fn access(&self, _req: Request, _inode: u64, _mask: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _inode: u64) -> FuseResult<ReplyStatFs> {
        // The remote advertises no usable quota; report infinite space.
        Ok(ReplyStatFs {
            blocks: u64::MAX,
            bfree: u64::MAX,
            bavail: u64::MAX,
            files: 0,
            ffree: u64::MAX,
            bsize: STATFS_BLOCK_SIZE,
            namelen: 255,
            frsize: STATFS_BLOCK_SIZE,
        })
    }
}

/// Operations used by integration tests to drive the core without a kernel
/// mount: they mirror the FUSE entry points one to one.
impl DriveFs {
    pub async fn op_getattr(&self, path: &str) -> FuseResult<Attributes> {
        if path.is_empty() {
            return Ok(Attributes {
                id: ObjectId::empty(),
                size: 0,
                is_regular_file: false,
                mode: 0o755,
                has_content: false,
            });
        }
        self.core.meta.get_attrs(path).map_err(map_meta_read_error)
    }

    pub async fn op_create(&self, path: &str, flags: u32, mode: u32) -> FuseResult<u64> {
        let (parent, name) = split_path(path);
        let parent_ino = self.core.inodes.get_or_create(parent);
        let reply = self
            .create(synthetic_request(), parent_ino, OsStr::new(name), mode, flags)
            .await?;
        Ok(reply.fh)
    }

    pub async fn op_open(&self, path: &str, flags: u32) -> FuseResult<u64> {
        let ino = self.core.inodes.get_or_create(path);
        let reply = self.open(synthetic_request(), ino, flags).await?;
        Ok(reply.fh)
    }

    pub async fn op_read(&self, path: &str, fh: u64, offset: u64, size: u32) -> FuseResult<Bytes> {
        let ino = self.core.inodes.get_or_create(path);
        let reply = self.read(synthetic_request(), ino, fh, offset, size).await?;
        Ok(reply.data)
    }

    pub async fn op_write(&self, path: &str, fh: u64, offset: u64, data: &[u8]) -> FuseResult<u32> {
        let ino = self.core.inodes.get_or_create(path);
        let reply = self
            .write(synthetic_request(), ino, fh, offset, data, 0, 0)
            .await?;
        Ok(reply.written)
    }

    pub async fn op_flush(&self, path: &str, fh: u64) -> FuseResult<()> {
        let ino = self.core.inodes.get_or_create(path);
        self.flush(synthetic_request(), ino, fh, 0).await
    }

    pub async fn op_release(&self, path: &str, fh: u64) -> FuseResult<()> {
        let ino = self.core.inodes.get_or_create(path);
        self.release(synthetic_request(), ino, fh, 0, 0, false).await
    }

    pub async fn op_mkdir(&self, path: &str, mode: u32) -> FuseResult<()> {
        let (parent, name) = split_path(path);
        let parent_ino = self.core.inodes.get_or_create(parent);
        self.mkdir(synthetic_request(), parent_ino, OsStr::new(name), mode, 0)
            .await?;
        Ok(())
    }

    pub async fn op_rmdir(&self, path: &str) -> FuseResult<()> {
        let (parent, name) = split_path(path);
        let parent_ino = self.core.inodes.get_or_create(parent);
        self.rmdir(synthetic_request(), parent_ino, OsStr::new(name))
            .await
    }

    pub async fn op_unlink(&self, path: &str) -> FuseResult<()> {
        let (parent, name) = split_path(path);
        let parent_ino = self.core.inodes.get_or_create(parent);
        self.unlink(synthetic_request(), parent_ino, OsStr::new(name))
            .await
    }

    pub async fn op_rename(&self, old: &str, new: &str) -> FuseResult<()> {
        let (old_parent, old_name) = split_path(old);
        let (new_parent, new_name) = split_path(new);
        let old_parent_ino = self.core.inodes.get_or_create(old_parent);
        let new_parent_ino = self.core.inodes.get_or_create(new_parent);
        self.rename(
            synthetic_request(),
            old_parent_ino,
            OsStr::new(old_name),
            new_parent_ino,
            OsStr::new(new_name),
        )
        .await
    }

    pub async fn op_list_dir(&self, path: &str) -> FuseResult<Vec<String>> {
        let listing = self.core.meta.list(path).map_err(map_meta_read_error)?;
        Ok(listing.into_iter().map(|entry| entry.name).collect())
    }

    pub async fn op_chmod(&self, path: &str, mode: u32) -> FuseResult<()> {
        self.core
            .meta
            .set_mode(path, mode & 0o7777)
            .await
            .map_err(map_meta_error)
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Request context for operations driven outside the kernel transport.
fn synthetic_request() -> Request {
    Request {
        unique: 0,
        uid: 0,
        gid: 0,
        pid: 0,
    }
}
