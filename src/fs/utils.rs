use std::time::{Duration, UNIX_EPOCH};

use fuse3::raw::reply::FileAttr;
use fuse3::{Errno, FileType};
use nix::unistd::{getgid, getuid};

use crate::cache::CacheError;
use crate::meta::MetaError;
use crate::remote::RemoteError;
use crate::types::Attributes;

pub(crate) const ATTR_TTL: Duration = Duration::from_secs(1);

pub(crate) fn errno(code: i32) -> Errno {
    Errno::from(code)
}

pub(crate) fn map_meta_error(err: MetaError) -> Errno {
    match err {
        MetaError::DoesNotExist => errno(libc::ENOENT),
        MetaError::AlreadyExists => errno(libc::EEXIST),
        MetaError::Store(_) => errno(libc::EIO),
    }
}

/// Attribute lookups distinguish plain not-found from a store failure; the
/// latter reports missing data rather than a generic I/O error.
pub(crate) fn map_meta_read_error(err: MetaError) -> Errno {
    match err {
        MetaError::DoesNotExist => errno(libc::ENOENT),
        MetaError::AlreadyExists => errno(libc::EEXIST),
        MetaError::Store(_) => errno(libc::ENODATA),
    }
}

pub(crate) fn map_cache_error(err: CacheError) -> Errno {
    match err {
        CacheError::ReadOnly => errno(libc::EPERM),
        CacheError::Remote(_) => errno(libc::EIO),
        CacheError::Other(_) => errno(libc::EIO),
    }
}

pub(crate) fn map_remote_error(_err: RemoteError) -> Errno {
    // Transient failures were already retried below this layer; whatever
    // surfaces is permanent.
    errno(libc::EIO)
}

pub(crate) fn attrs_to_file_attr(ino: u64, attrs: &Attributes) -> FileAttr {
    let kind = if attrs.is_regular_file {
        FileType::RegularFile
    } else {
        FileType::Directory
    };
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.size.div_ceil(512),
        atime: UNIX_EPOCH.into(),
        mtime: UNIX_EPOCH.into(),
        ctime: UNIX_EPOCH.into(),
        kind,
        perm: (attrs.mode & 0o7777) as u16,
        nlink: if attrs.is_regular_file { 1 } else { 2 },
        uid: getuid().as_raw(),
        gid: getgid().as_raw(),
        rdev: 0,
        blksize: 4096,
    }
}

/// The mount point itself has no record; it is a synthetic directory.
pub(crate) fn root_attr(ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH.into(),
        mtime: UNIX_EPOCH.into(),
        ctime: UNIX_EPOCH.into(),
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid: getuid().as_raw(),
        gid: getgid().as_raw(),
        rdev: 0,
        blksize: 4096,
    }
}

pub(crate) fn is_read_only(flags: u32) -> bool {
    (flags as i32) & libc::O_ACCMODE == libc::O_RDONLY
}

pub(crate) fn wants_truncate(flags: u32) -> bool {
    (flags as i32) & libc::O_TRUNC != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectId;

    #[test]
    fn file_attr_reflects_record() {
        let attrs = Attributes {
            id: ObjectId::empty(),
            size: 4096,
            is_regular_file: true,
            mode: 0o640,
            has_content: false,
        };
        let attr = attrs_to_file_attr(7, &attrs);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.size, 4096);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.kind, FileType::RegularFile);
    }

    #[test]
    fn open_flag_classification() {
        assert!(is_read_only(libc::O_RDONLY as u32));
        assert!(!is_read_only(libc::O_WRONLY as u32));
        assert!(!is_read_only(libc::O_RDWR as u32));
        assert!(wants_truncate((libc::O_WRONLY | libc::O_TRUNC) as u32));
    }
}
