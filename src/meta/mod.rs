use std::path::Path;

use anyhow::Context;
use surrealkv::{Mode, Tree, TreeBuilder};
use thiserror::Error;
use tracing::debug;

use crate::types::{
    content_key, keys_key, paths_key, prefix_end, uploads_key, Attributes, Upload,
    KEY_PREFIX_CONTENT, KEY_PREFIX_PATHS, KEY_PREFIX_UPLOADS, PATH_SEPARATOR, SALT_LEN,
};

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("does not exist")]
    DoesNotExist,
    #[error("already exists")]
    AlreadyExists,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type MetaResult<T> = Result<T, MetaError>;

/// A directory listing entry: name relative to the listed directory plus the
/// child's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub attributes: Attributes,
}

/// Persistent namespace for the filesystem: path attributes, inline file
/// content, the durable upload queue and auxiliary keys, all in one embedded
/// tree. Buckets are realised as key prefixes.
pub struct MetaStore {
    tree: Tree,
}

impl MetaStore {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let tree = TreeBuilder::new()
            .with_path(path.to_path_buf())
            .with_max_memtable_size(16 * 1024 * 1024)
            .build()
            .context("failed to open metadata store")?;
        Ok(Self { tree })
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.tree.close().await.context("failed to close metadata store")
    }

    fn read_txn<F, R>(&self, f: F) -> MetaResult<R>
    where
        F: FnOnce(&surrealkv::Transaction) -> MetaResult<R>,
    {
        let txn = self
            .tree
            .begin_with_mode(Mode::ReadOnly)
            .context("failed to start readonly transaction")?;
        f(&txn)
    }

    async fn write_txn<F>(&self, f: F) -> MetaResult<()>
    where
        F: FnOnce(&mut surrealkv::Transaction) -> MetaResult<()>,
    {
        let mut txn = self
            .tree
            .begin()
            .context("failed to start write transaction")?;
        f(&mut txn)?;
        txn.commit()
            .await
            .context("failed to commit transaction")?;
        Ok(())
    }

    pub fn get_attrs(&self, path: &str) -> MetaResult<Attributes> {
        self.read_txn(|txn| {
            let Some(raw) = txn.get(&paths_key(path)).context("attrs lookup")? else {
                return Err(MetaError::DoesNotExist);
            };
            Ok(Attributes::decode(&raw)?)
        })
    }

    pub async fn set_attrs(&self, path: &str, attrs: &Attributes) -> MetaResult<()> {
        debug!(path, ?attrs, "set_attrs");
        let encoded = attrs.encode();
        self.write_txn(|txn| {
            txn.set(&paths_key(path), &encoded).context("attrs write")?;
            Ok(())
        })
        .await
    }

    /// Inserts attributes for a path that must not already exist. Used by
    /// create and mkdir so the existence check and the write share one
    /// transaction.
    pub async fn insert_attrs(&self, path: &str, attrs: &Attributes) -> MetaResult<()> {
        debug!(path, ?attrs, "insert_attrs");
        let encoded = attrs.encode();
        self.write_txn(|txn| {
            let key = paths_key(path);
            if txn.get(&key).context("attrs lookup")?.is_some() {
                return Err(MetaError::AlreadyExists);
            }
            txn.set(&key, &encoded).context("attrs write")?;
            Ok(())
        })
        .await
    }

    /// Atomically reads and removes a path record.
    pub async fn get_and_delete_attrs(&self, path: &str) -> MetaResult<Attributes> {
        debug!(path, "get_and_delete_attrs");
        let mut out: Option<Attributes> = None;
        self.write_txn(|txn| {
            let key = paths_key(path);
            let Some(raw) = txn.get(&key).context("attrs lookup")? else {
                return Err(MetaError::DoesNotExist);
            };
            out = Some(Attributes::decode(&raw)?);
            txn.delete(&key).context("attrs delete")?;
            Ok(())
        })
        .await?;
        out.ok_or_else(|| MetaError::Store(anyhow::anyhow!("missing deleted attributes")))
    }

    /// Lists the direct children of `path`, names relative to it.
    ///
    /// The record equal to the path itself marks the directory as existing
    /// and is skipped. A non-empty path with no such record yields
    /// `DoesNotExist`; the empty path is the root and always exists.
    pub fn list(&self, path: &str) -> MetaResult<Vec<Entry>> {
        self.read_txn(|txn| {
            let prefix = paths_key(path);
            let mut exists = path.is_empty();
            let mut entries = Vec::new();

            for (key, value) in scan_range_pairs(txn, prefix.clone(), prefix_end(&prefix))? {
                if key == prefix {
                    exists = true;
                    continue;
                }

                let full = &key[KEY_PREFIX_PATHS.len()..];
                let mut relative = &full[path.len()..];
                if !path.is_empty() {
                    // A sibling like `ab` also starts with prefix `a`; only
                    // suffixes introduced by a separator are children.
                    match relative.first() {
                        Some(&PATH_SEPARATOR) => relative = &relative[1..],
                        _ => continue,
                    }
                }
                if relative.contains(&PATH_SEPARATOR) {
                    continue;
                }

                entries.push(Entry {
                    name: String::from_utf8_lossy(relative).into_owned(),
                    attributes: Attributes::decode(&value)?,
                });
            }

            if !exists {
                return Err(MetaError::DoesNotExist);
            }
            Ok(entries)
        })
    }

    pub fn is_directory_empty(&self, path: &str) -> MetaResult<bool> {
        Ok(self.list(path)?.is_empty())
    }

    pub async fn set_size(&self, path: &str, size: u64) -> MetaResult<()> {
        debug!(path, size, "set_size");
        self.update_attrs(path, |attrs| attrs.size = size).await
    }

    pub async fn set_mode(&self, path: &str, mode: u32) -> MetaResult<()> {
        debug!(path, mode, "set_mode");
        self.update_attrs(path, |attrs| attrs.mode = mode).await
    }

    pub async fn set_id(&self, path: &str, id: &crate::types::ObjectId) -> MetaResult<()> {
        debug!(path, ?id, "set_id");
        let id = id.clone();
        self.update_attrs(path, move |attrs| attrs.id = id).await
    }

    async fn update_attrs<F>(&self, path: &str, update: F) -> MetaResult<()>
    where
        F: FnOnce(&mut Attributes),
    {
        self.write_txn(|txn| {
            let key = paths_key(path);
            let Some(raw) = txn.get(&key).context("attrs lookup")? else {
                return Err(MetaError::DoesNotExist);
            };
            let mut attrs = Attributes::decode(&raw)?;
            update(&mut attrs);
            txn.set(&key, &attrs.encode()).context("attrs write")?;
            Ok(())
        })
        .await
    }

    /// Renames a path and every descendant sharing the prefix, atomically.
    /// Inline content moves with its path so content and attributes cannot
    /// drift apart across a rename.
    pub async fn rename(&self, old: &str, new: &str) -> MetaResult<()> {
        debug!(old, new, "rename");
        self.write_txn(|txn| {
            if txn.get(&paths_key(old)).context("attrs lookup")?.is_none() {
                return Err(MetaError::DoesNotExist);
            }
            if txn.get(&paths_key(new)).context("attrs lookup")?.is_some() {
                return Err(MetaError::AlreadyExists);
            }

            for bucket in [KEY_PREFIX_PATHS, KEY_PREFIX_CONTENT] {
                let mut old_prefix = bucket.to_vec();
                old_prefix.extend_from_slice(old.as_bytes());
                let mut new_prefix = bucket.to_vec();
                new_prefix.extend_from_slice(new.as_bytes());

                for (key, value) in
                    scan_range_pairs(txn, old_prefix.clone(), prefix_end(&old_prefix))?
                {
                    let mut new_key = new_prefix.clone();
                    new_key.extend_from_slice(&key[old_prefix.len()..]);
                    txn.set(&new_key, &value).context("rename write")?;
                    txn.delete(&key).context("rename delete")?;
                }
            }
            Ok(())
        })
        .await
    }

    pub fn get_file(&self, path: &str) -> MetaResult<Option<Vec<u8>>> {
        self.read_txn(|txn| {
            Ok(txn
                .get(&content_key(path))
                .context("content lookup")?
                .map(|v| v.to_vec()))
        })
    }

    pub async fn put_file(&self, path: &str, data: Vec<u8>) -> MetaResult<()> {
        debug!(path, len = data.len(), "put_file");
        self.write_txn(|txn| {
            txn.set(&content_key(path), &data).context("content write")?;
            Ok(())
        })
        .await
    }

    pub async fn remove_file(&self, path: &str) -> MetaResult<()> {
        debug!(path, "remove_file");
        self.write_txn(|txn| {
            txn.delete(&content_key(path)).context("content delete")?;
            Ok(())
        })
        .await
    }

    /// Read-modify-write of an inline file, growing it as needed, and the
    /// matching size update, in a single transaction so concurrent writers
    /// cannot interleave.
    pub async fn write_file(&self, path: &str, offset: u64, data: &[u8]) -> MetaResult<usize> {
        let offset = offset as usize;
        self.write_txn(|txn| {
            let mut content: Vec<u8> = txn
                .get(&content_key(path))
                .context("content lookup")?
                .map(|v| v.to_vec())
                .unwrap_or_default();
            if content.len() < offset + data.len() {
                content.resize(offset + data.len(), 0);
            }
            content[offset..offset + data.len()].copy_from_slice(data);
            let size = content.len() as u64;
            txn.set(&content_key(path), &content).context("content write")?;

            let attrs_key = paths_key(path);
            let Some(raw) = txn.get(&attrs_key).context("attrs lookup")? else {
                return Err(MetaError::DoesNotExist);
            };
            let mut attrs = Attributes::decode(&raw)?;
            attrs.size = size;
            txn.set(&attrs_key, &attrs.encode()).context("attrs write")?;
            Ok(())
        })
        .await?;
        Ok(data.len())
    }

    /// Truncates or zero-extends an inline file and updates its size.
    pub async fn truncate_file(&self, path: &str, size: u64) -> MetaResult<()> {
        debug!(path, size, "truncate_file");
        let size = size as usize;
        self.write_txn(|txn| {
            let mut content: Vec<u8> = txn
                .get(&content_key(path))
                .context("content lookup")?
                .map(|v| v.to_vec())
                .unwrap_or_default();
            content.resize(size, 0);
            txn.set(&content_key(path), &content).context("content write")?;

            let attrs_key = paths_key(path);
            let Some(raw) = txn.get(&attrs_key).context("attrs lookup")? else {
                return Err(MetaError::DoesNotExist);
            };
            let mut attrs = Attributes::decode(&raw)?;
            attrs.size = size as u64;
            txn.set(&attrs_key, &attrs.encode()).context("attrs write")?;
            Ok(())
        })
        .await
    }

    pub async fn add_to_upload_queue(&self, upload: &Upload) -> MetaResult<()> {
        debug!(path = %upload.path, local = %upload.local_path, "add_to_upload_queue");
        let encoded = upload.encode();
        self.write_txn(|txn| {
            txn.set(&uploads_key(&upload.local_path), &encoded)
                .context("upload record write")?;
            Ok(())
        })
        .await
    }

    pub async fn remove_from_upload_queue(&self, upload: &Upload) -> MetaResult<()> {
        debug!(path = %upload.path, local = %upload.local_path, "remove_from_upload_queue");
        self.write_txn(|txn| {
            txn.delete(&uploads_key(&upload.local_path))
                .context("upload record delete")?;
            Ok(())
        })
        .await
    }

    pub fn get_upload_queue(&self) -> MetaResult<Vec<Upload>> {
        self.read_txn(|txn| {
            let prefix = KEY_PREFIX_UPLOADS.to_vec();
            let mut out = Vec::new();
            for (_key, value) in scan_range_pairs(txn, prefix.clone(), prefix_end(&prefix))? {
                out.push(Upload::decode(&value)?);
            }
            Ok(out)
        })
    }

    pub fn get_salt(&self) -> MetaResult<Option<Vec<u8>>> {
        self.read_txn(|txn| {
            Ok(txn
                .get(&keys_key("salt"))
                .context("salt lookup")?
                .map(|v| v.to_vec()))
        })
    }

    pub async fn put_salt(&self, salt: &[u8]) -> MetaResult<()> {
        if salt.len() != SALT_LEN {
            return Err(MetaError::Store(anyhow::anyhow!(
                "salt must be {} bytes, got {}",
                SALT_LEN,
                salt.len()
            )));
        }
        self.write_txn(|txn| {
            txn.set(&keys_key("salt"), salt).context("salt write")?;
            Ok(())
        })
        .await
    }
}

fn scan_range_pairs(
    txn: &surrealkv::Transaction,
    start: Vec<u8>,
    end: Vec<u8>,
) -> MetaResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    let iter = txn.range(start, end, None).context("range scan")?;
    for item in iter {
        let (key, value) = item.context("range next")?;
        let Some(value) = value else {
            continue;
        };
        out.push((key.to_vec(), value.to_vec()));
    }
    Ok(out)
}
