use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// The FUSE root inode; maps to the empty path.
pub const ROOT_INODE: u64 = 1;

/// Inode to path mapping for the kernel interface.
///
/// The core of the filesystem is keyed by path; the kernel speaks inodes.
/// Inodes are allocated on first sight of a path and follow renames. Uses
/// lock-free maps so FUSE handler tasks never block each other here.
pub struct InodeTable {
    inode_to_path: DashMap<u64, String>,
    path_to_inode: DashMap<String, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    pub fn new() -> Self {
        let inode_to_path = DashMap::new();
        let path_to_inode = DashMap::new();
        inode_to_path.insert(ROOT_INODE, String::new());
        path_to_inode.insert(String::new(), ROOT_INODE);
        InodeTable {
            inode_to_path,
            path_to_inode,
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    pub fn get_or_create(&self, path: &str) -> u64 {
        if let Some(ino) = self.path_to_inode.get(path) {
            return *ino;
        }
        let ino = self.next_inode.fetch_add(1, Ordering::Relaxed);
        self.path_to_inode.insert(path.to_owned(), ino);
        self.inode_to_path.insert(ino, path.to_owned());
        ino
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.inode_to_path.get(&ino).map(|entry| entry.value().clone())
    }

    pub fn remove_path(&self, path: &str) {
        if let Some((_, ino)) = self.path_to_inode.remove(path) {
            self.inode_to_path.remove(&ino);
        }
    }

    /// Follows a rename: every mapped path equal to `old` or below it is
    /// rewritten under `new`, keeping its inode.
    pub fn rename_prefix(&self, old: &str, new: &str) {
        let moved: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|entry| {
                let path = entry.key();
                path == old || path.starts_with(&format!("{}/", old))
            })
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        for (path, ino) in moved {
            let renamed = format!("{}{}", new, &path[old.len()..]);
            self.path_to_inode.remove(&path);
            self.path_to_inode.insert(renamed.clone(), ino);
            self.inode_to_path.insert(ino, renamed);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
