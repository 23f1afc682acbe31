//! Real filesystem backends holding the bytes behind the overlay.
//!
//! Every method takes an overlay path (absolute, `/` is the mount point) and reports
//! failures through [`Error::io`] so callers see the common not-found, exists and
//! permission taxonomy whatever the backend.

pub mod local;
pub mod nfs4;

pub use local::LocalFs;
pub use nfs4::Nfs4Fs;

use crate::acl::Acl;
use crate::document::Stats;
use crate::error::Result;
use crate::identity::UserDirectory;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The stat fields the overlay records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RealStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
    pub nlink: u64,
    pub blocks: u64,
}

impl RealStat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

impl From<&RealStat> for Stats {
    fn from(stat: &RealStat) -> Self {
        Stats {
            mode: stat.mode,
            uid: stat.uid,
            gid: stat.gid,
            size: stat.size,
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.ctime,
            // hard links are not modeled
            nlink: 1,
            blocks: stat.blocks,
        }
    }
}

/// An open file handle of a backend.
pub trait ByteStream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> ByteStream for T {}

pub trait RealFs: Send + Sync {
    /// Directory of the mount point.
    fn root(&self) -> &Path;

    fn real_path(&self, path: &str) -> PathBuf;

    fn lstat(&self, path: &str) -> Result<RealStat>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    /// Remove a directory and everything below it.
    fn rmtree(&self, path: &str) -> Result<()>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn symlink(&self, target: &str, path: &str) -> Result<()>;
    fn readlink(&self, path: &str) -> Result<String>;
    fn rename(&self, old: &str, new: &str) -> Result<()>;
    fn chmod(&self, path: &str, mode: u32) -> Result<()>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()>;
    fn utime(&self, path: &str, atime: f64, mtime: f64) -> Result<()>;
    fn truncate(&self, path: &str, size: u64) -> Result<()>;

    /// Open with `open(2)` flags; `mode` applies when the file is created.
    fn open(&self, path: &str, flags: i32, mode: u32) -> Result<Box<dyn ByteStream>>;

    /// Best guess of the content type, or one of the directory, symlink and empty sentinels.
    fn mime_type(&self, path: &str) -> Result<String>;

    fn set_acl(&self, path: &str, acl: &Acl) -> Result<()>;
    fn get_acl(&self, path: &str) -> Result<Option<Acl>>;

    fn setxattr(&self, path: &str, key: &str, value: &[u8]) -> Result<()>;
    fn getxattr(&self, path: &str, key: &str) -> Result<Option<Vec<u8>>>;
    fn removexattr(&self, path: &str, key: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Nfs4,
}

/// Build the backend selected by `kind` over `mount_point`.
pub fn open(
    kind: BackendKind,
    mount_point: impl Into<PathBuf>,
    directory: Arc<dyn UserDirectory>,
    nfs4_domain: &str,
) -> Result<Arc<dyn RealFs>> {
    let local = LocalFs::new(mount_point)?;
    Ok(match kind {
        BackendKind::Local => Arc::new(local),
        BackendKind::Nfs4 => Arc::new(Nfs4Fs::new(local, directory, nfs4_domain)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticDirectory;

    #[test]
    fn selects_backend() {
        let tempdir = tempfile::tempdir().unwrap();
        let directory: Arc<dyn UserDirectory> = Arc::new(StaticDirectory::new());
        let fs = open(BackendKind::Nfs4, tempdir.path(), directory.clone(), "example.org").unwrap();
        assert_eq!(fs.root(), tempdir.path());
        // raw xattrs are not forwarded over NFSv4
        fs.setxattr("/", "user.k", b"v").unwrap();
        assert_eq!(fs.getxattr("/", "user.k").unwrap(), None);

        assert!(open(BackendKind::Local, tempdir.path().join("missing"), directory, "d").is_err());
    }

    #[test]
    fn stats_conversion_pins_nlink() {
        let stat = RealStat {
            mode: libc::S_IFDIR | 0o755,
            nlink: 4,
            size: 4096,
            ..RealStat::default()
        };
        assert!(stat.is_dir());
        let stats = Stats::from(&stat);
        assert_eq!(stats.nlink, 1);
        assert!(stats.is_dir());
        assert_eq!(stats.size, 4096);
    }
}
