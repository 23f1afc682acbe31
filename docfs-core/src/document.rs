//! Metadata documents describing filesystem entries.

use crate::acl::{Acl, JsonAce};
use crate::error::Result;
use crate::path;
use crate::storage::Doctype;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub const DIRECTORY_TYPE: &str = "application/x-directory";
pub const SYMLINK_TYPE: &str = "application/x-symlink";
pub const EMPTY_TYPE: &str = "application/x-empty";
pub const DEFAULT_TYPE: &str = "application/octet-stream";

/// Identity of the synthesized root directory document.
pub const ROOT_ID: &str = "00000000000000000000000000000000";

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Snapshot of the POSIX stat fields of an entry. Times are seconds since the epoch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
    #[serde(default = "default_nlink")]
    pub nlink: u32,
    #[serde(default)]
    pub blocks: u64,
}

fn default_nlink() -> u32 {
    1
}

impl Stats {
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }
}

/// Opaque extended attribute bytes, stored base64 encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XattrValue(pub Vec<u8>);

impl Serialize for XattrValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for XattrValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(XattrValue)
            .map_err(serde::de::Error::custom)
    }
}

/// One document per file, directory or symlink.
///
/// The path is derived from `dirpath` and `filename`; the pair is unique within a store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncDocument {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_rev", default)]
    pub rev: u64,
    pub filename: String,
    pub dirpath: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub stats: Stats,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub xattrs: BTreeMap<String, XattrValue>,
    #[serde(default)]
    pub acl: Vec<JsonAce>,
}

impl Doctype for SyncDocument {
    const DOCTYPE: &'static str = "SyncDocument";

    fn id(&self) -> &str {
        &self.id
    }

    fn rev(&self) -> u64 {
        self.rev
    }

    fn set_rev(&mut self, rev: u64) {
        self.rev = rev;
    }
}

impl SyncDocument {
    /// A new, not yet stored document for `path` with a fresh identity.
    pub fn new(entry_path: &str, mime_type: impl Into<String>, stats: Stats) -> Self {
        let normalized = path::normalize(entry_path);
        let mut doc = Self {
            id: Uuid::new_v4().simple().to_string(),
            rev: 0,
            filename: path::basename(&normalized).to_string(),
            dirpath: path::dirname(&normalized).to_string(),
            mime_type: mime_type.into(),
            stats,
            tags: BTreeSet::new(),
            xattrs: BTreeMap::new(),
            acl: Vec::new(),
        };
        doc.stats.nlink = 1;
        doc.align_type();
        doc
    }

    /// The root directory, which is never stored.
    pub fn root(stats: Stats) -> Self {
        let mut doc = Self::new("/", DIRECTORY_TYPE, stats);
        doc.id = ROOT_ID.to_string();
        doc.stats.mode = S_IFDIR | (doc.stats.mode & 0o7777);
        doc
    }

    /// A synthesized read-only directory used by virtual listings.
    pub fn virtual_dir(dirpath: &str, filename: &str, uid: u32, gid: u32) -> Self {
        let stats = Stats {
            mode: S_IFDIR | 0o555,
            uid,
            gid,
            nlink: 1,
            ..Stats::default()
        };
        Self::new(&path::join(dirpath, filename), DIRECTORY_TYPE, stats)
    }

    pub fn path(&self) -> String {
        path::join(&self.dirpath, &self.filename)
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    pub fn is_dir(&self) -> bool {
        self.stats.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.stats.is_symlink()
    }

    /// Move the document to `new_path` without touching its identity.
    pub fn set_path(&mut self, new_path: &str) {
        let normalized = path::normalize(new_path);
        self.filename = path::basename(&normalized).to_string();
        self.dirpath = path::dirname(&normalized).to_string();
    }

    /// Keep the sentinel type and the file type bits of the mode in agreement.
    pub fn align_type(&mut self) {
        match self.stats.file_type() {
            S_IFDIR => self.mime_type = DIRECTORY_TYPE.to_string(),
            S_IFLNK => self.mime_type = SYMLINK_TYPE.to_string(),
            0 => {
                let bits = match self.mime_type.as_str() {
                    DIRECTORY_TYPE => S_IFDIR,
                    SYMLINK_TYPE => S_IFLNK,
                    _ => S_IFREG,
                };
                self.stats.mode |= bits;
            }
            _ => {
                if self.mime_type == DIRECTORY_TYPE || self.mime_type == SYMLINK_TYPE {
                    self.mime_type = DEFAULT_TYPE.to_string();
                }
            }
        }
    }

    /// `(category, subtype)` of the mime type.
    pub fn mime_parts(&self) -> (&str, &str) {
        self.mime_type
            .split_once('/')
            .unwrap_or((self.mime_type.as_str(), ""))
    }

    /// The full ACL: persisted named-user grants completed from the mode.
    pub fn posix_acl(&self) -> Result<Acl> {
        let mut acl = if self.acl.is_empty() {
            Acl::from_mode(self.stats.mode)
        } else {
            Acl::from_json(&self.acl, Some(self.stats.mode))
        };
        acl.check(true)?;
        Ok(acl)
    }

    pub fn tag(&mut self, tag: &str) -> bool {
        self.tags.insert(tag.to_string())
    }

    pub fn untag(&mut self, tag: &str) -> bool {
        self.tags.remove(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{Privilege, ACL_XATTR};

    fn stats(mode: u32) -> Stats {
        Stats {
            mode,
            uid: 1000,
            gid: 1000,
            size: 5,
            ..Stats::default()
        }
    }

    #[test]
    fn path_is_derived() {
        let doc = SyncDocument::new("/docs//a.txt", "text/plain", stats(S_IFREG | 0o644));
        assert_eq!(doc.dirpath, "/docs");
        assert_eq!(doc.filename, "a.txt");
        assert_eq!(doc.path(), "/docs/a.txt");
        assert_eq!(doc.mime_parts(), ("text", "plain"));

        let top = SyncDocument::new("/docs", DIRECTORY_TYPE, stats(0o755));
        assert_eq!(top.dirpath, "/");
        assert_eq!(top.path(), "/docs");
        assert!(top.is_dir());
    }

    #[test]
    fn root_is_reserved() {
        let root = SyncDocument::root(stats(0o755));
        assert!(root.is_root());
        assert_eq!(root.path(), "/");
        assert_eq!(root.mime_type, DIRECTORY_TYPE);
    }

    #[test]
    fn type_follows_mode() {
        let link = SyncDocument::new("/l", "text/plain", stats(S_IFLNK | 0o777));
        assert_eq!(link.mime_type, SYMLINK_TYPE);
        let file = SyncDocument::new("/f", DIRECTORY_TYPE, stats(S_IFREG | 0o644));
        assert_eq!(file.mime_type, DEFAULT_TYPE);
    }

    #[test]
    fn serializes_xattrs_as_base64() {
        let mut doc = SyncDocument::new("/f", "text/plain", stats(S_IFREG | 0o644));
        doc.xattrs
            .insert("user.comment".to_string(), XattrValue(b"hi".to_vec()));
        doc.acl.push(JsonAce {
            qualifier: 1001,
            privileges: vec![Privilege::Read],
        });
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["xattrs"]["user.comment"], "aGk=");
        assert_eq!(value["type"], "text/plain");
        let back: SyncDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
        assert!(!back.xattrs.contains_key(ACL_XATTR));
    }

    #[test]
    fn acl_is_completed_from_mode() {
        let mut doc = SyncDocument::new("/f", "text/plain", stats(S_IFREG | 0o640));
        assert_eq!(doc.posix_acl().unwrap().entries().len(), 3);
        doc.acl.push(JsonAce {
            qualifier: 1001,
            privileges: vec![Privilege::Read, Privilege::Write],
        });
        let acl = doc.posix_acl().unwrap();
        assert_eq!(acl.entries().len(), 5);
        assert!(acl.is_extended());
    }
}
