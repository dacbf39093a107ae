use std::fmt;

use anyhow::{bail, Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;

/// Length of the empty-id sentinel and of locally generated ids.
pub const OBJECT_ID_LEN: usize = 33;

pub const SALT_LEN: usize = 32;

pub const KEY_PREFIX_PATHS: &[u8] = b"P:";
pub const KEY_PREFIX_CONTENT: &[u8] = b"C:";
pub const KEY_PREFIX_KEYS: &[u8] = b"K:";
pub const KEY_PREFIX_UPLOADS: &[u8] = b"U:";

pub const PATH_SEPARATOR: u8 = b'/';

/// Opaque remote object identifier.
///
/// A freshly created file that has not reached the remote yet carries the
/// empty-id sentinel (33 zero bytes). Inline files carry a locally generated
/// id that is never used against the remote.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(Vec<u8>);

impl ObjectId {
    pub fn empty() -> Self {
        ObjectId(vec![0_u8; OBJECT_ID_LEN])
    }

    pub fn is_empty_sentinel(&self) -> bool {
        self.0.len() == OBJECT_ID_LEN && self.0.iter().all(|b| *b == 0)
    }

    /// Generates a local id for files that never touch the remote. The `L`
    /// prefix keeps it distinguishable from remote-assigned ids and from the
    /// all-zero sentinel.
    pub fn generate_local() -> Self {
        let mut raw = [0_u8; 16];
        OsRng.fill_bytes(&mut raw);
        let mut id = String::with_capacity(OBJECT_ID_LEN);
        id.push('L');
        for byte in raw {
            id.push_str(&format!("{:02x}", byte));
        }
        ObjectId(id.into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        ObjectId(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The id as it appears in request urls. Remote-assigned ids are always
    /// printable; the sentinel never reaches the remote.
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty_sentinel() {
            write!(f, "ObjectId(<empty>)")
        } else {
            write!(f, "ObjectId({})", self.as_str())
        }
    }
}

/// Attributes of a node on the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    /// Remote object id for this node.
    pub id: ObjectId,
    /// Number of bytes stored by this file. Zero for directories.
    pub size: u64,
    /// True for files, false for directories.
    pub is_regular_file: bool,
    /// Permission bits only; the file type is derived from `is_regular_file`.
    pub mode: u32,
    /// True if the file content lives inline in the metadata store.
    pub has_content: bool,
}

impl Attributes {
    /// Serialises into the on-disk layout:
    /// `u32 id_len | id | u64 size | u8 is_regular_file | u32 mode |
    /// u8 has_content`, all little-endian. This layout is a compatibility
    /// surface and must not change.
    pub fn encode(&self) -> Vec<u8> {
        let id = self.id.as_bytes();
        let mut out = Vec::with_capacity(4 + id.len() + 8 + 1 + 4 + 1);
        out.extend_from_slice(&(id.len() as u32).to_le_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.push(self.is_regular_file as u8);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.push(self.has_content as u8);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(raw);
        let id_len = cursor.read_u32()? as usize;
        let id = ObjectId::from_bytes(cursor.read_slice(id_len)?);
        let size = cursor.read_u64()?;
        let is_regular_file = cursor.read_u8()? != 0;
        let mode = cursor.read_u32()?;
        let has_content = cursor.read_u8()? != 0;
        Ok(Attributes {
            id,
            size,
            is_regular_file,
            mode,
            has_content,
        })
    }
}

/// A pending upload persisted in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Remote object id, or the empty-id sentinel for an upload-create.
    pub id: ObjectId,
    /// Local staging file holding the bytes to upload.
    pub local_path: String,
    /// Filesystem path, needed so an upload-create can record the new id.
    pub path: String,
}

impl Upload {
    pub fn encode(&self) -> Vec<u8> {
        let id = self.id.as_bytes();
        let local = self.local_path.as_bytes();
        let path = self.path.as_bytes();
        let mut out = Vec::with_capacity(12 + id.len() + local.len() + path.len());
        out.extend_from_slice(&(id.len() as u32).to_le_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(&(local.len() as u32).to_le_bytes());
        out.extend_from_slice(local);
        out.extend_from_slice(&(path.len() as u32).to_le_bytes());
        out.extend_from_slice(path);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(raw);
        let id_len = cursor.read_u32()? as usize;
        let id = ObjectId::from_bytes(cursor.read_slice(id_len)?);
        let local_len = cursor.read_u32()? as usize;
        let local_path = String::from_utf8(cursor.read_slice(local_len)?.to_vec())
            .context("upload record local path is not utf-8")?;
        let path_len = cursor.read_u32()? as usize;
        let path = String::from_utf8(cursor.read_slice(path_len)?.to_vec())
            .context("upload record path is not utf-8")?;
        Ok(Upload {
            id,
            local_path,
            path,
        })
    }
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Cursor { raw, pos: 0 }
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.raw.len() - self.pos < len {
            bail!(
                "record truncated: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.raw.len() - self.pos
            );
        }
        let out = &self.raw[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let raw = self.read_slice(4)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("4 byte slice")))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let raw = self.read_slice(8)?;
        Ok(u64::from_le_bytes(raw.try_into().expect("8 byte slice")))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_slice(1)?[0])
    }
}

pub fn paths_key(path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX_PATHS.len() + path.len());
    key.extend_from_slice(KEY_PREFIX_PATHS);
    key.extend_from_slice(path.as_bytes());
    key
}

pub fn content_key(path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX_CONTENT.len() + path.len());
    key.extend_from_slice(KEY_PREFIX_CONTENT);
    key.extend_from_slice(path.as_bytes());
    key
}

pub fn keys_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX_KEYS.len() + name.len());
    key.extend_from_slice(KEY_PREFIX_KEYS);
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn uploads_key(local_path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX_UPLOADS.len() + local_path.len());
    key.extend_from_slice(KEY_PREFIX_UPLOADS);
    key.extend_from_slice(local_path.as_bytes());
    key
}

/// Smallest key strictly greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    for idx in (0..end.len()).rev() {
        if end[idx] != 0xFF {
            end[idx] += 1;
            end.truncate(idx + 1);
            return end;
        }
    }
    end.push(0);
    end
}

/// Joins a parent path and a child name. The root directory is the empty
/// path, so joining under it yields the bare name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", parent, name)
    }
}

pub fn basename(path: &str) -> &str {
    match path.rfind(PATH_SEPARATOR as char) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_id_sentinel_is_33_zero_bytes() {
        let id = ObjectId::empty();
        assert_eq!(id.as_bytes().len(), OBJECT_ID_LEN);
        assert!(id.as_bytes().iter().all(|b| *b == 0));
        assert!(id.is_empty_sentinel());
    }

    #[test]
    fn local_ids_never_collide_with_sentinel() {
        let id = ObjectId::generate_local();
        assert_eq!(id.as_bytes().len(), OBJECT_ID_LEN);
        assert!(!id.is_empty_sentinel());
        assert_ne!(id, ObjectId::generate_local());
    }

    #[test]
    fn attributes_round_trip() {
        let attrs = Attributes {
            id: ObjectId::from_bytes(b"1kgcI9l0qzeB8LtmUd0RxTO_hjQYbdjoo"),
            size: 104_857_600,
            is_regular_file: true,
            mode: 0o644,
            has_content: false,
        };
        let decoded = Attributes::decode(&attrs.encode()).unwrap();
        assert_eq!(decoded, attrs);
    }

    #[test]
    fn attributes_round_trip_sentinel_and_flags() {
        let attrs = Attributes {
            id: ObjectId::empty(),
            size: 0,
            is_regular_file: false,
            mode: 0o755,
            has_content: true,
        };
        assert_eq!(Attributes::decode(&attrs.encode()).unwrap(), attrs);
    }

    #[test]
    fn attributes_encoding_is_bit_exact() {
        let attrs = Attributes {
            id: ObjectId::from_bytes(b"ab"),
            size: 0x0102_0304_0506_0708,
            is_regular_file: true,
            mode: 0o644,
            has_content: false,
        };
        let mut expected = Vec::new();
        expected.extend_from_slice(&2_u32.to_le_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&0x0102_0304_0506_0708_u64.to_le_bytes());
        expected.push(1);
        expected.extend_from_slice(&0o644_u32.to_le_bytes());
        expected.push(0);
        assert_eq!(attrs.encode(), expected);
    }

    #[test]
    fn attributes_decode_rejects_truncated_input() {
        let attrs = Attributes {
            id: ObjectId::from_bytes(b"abc"),
            size: 7,
            is_regular_file: true,
            mode: 0o600,
            has_content: false,
        };
        let encoded = attrs.encode();
        assert!(Attributes::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Attributes::decode(&[]).is_err());
    }

    #[test]
    fn upload_round_trip() {
        let upload = Upload {
            id: ObjectId::empty(),
            local_path: "/tmp/drivefs/staging/u-17".to_owned(),
            path: "docs/report.bin".to_owned(),
        };
        assert_eq!(Upload::decode(&upload.encode()).unwrap(), upload);
    }

    #[test]
    fn prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"P:a"), b"P:b".to_vec());
        assert_eq!(prefix_end(b"P:a\xff"), b"P:b".to_vec());
    }

    #[test]
    fn join_path_under_root_is_bare_name() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a", "b"), "a/b");
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("a/b/gocryptfs.diriv"), "gocryptfs.diriv");
        assert_eq!(basename("plain"), "plain");
    }
}
