use super::{ByteStream, RealFs, RealStat};
use crate::acl::{Acl, ACL_XATTR};
use crate::document::{DEFAULT_TYPE, DIRECTORY_TYPE, EMPTY_TYPE, SYMLINK_TYPE};
use crate::error::{Error, Result};
use crate::path;
use filetime::FileTime;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::Read;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Bytes read from the head of a file to detect its type.
const SNIFF_LEN: u64 = 8192;

/// Files under a local directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = fs::metadata(&root).map_err(|e| Error::io("open mount point", &root, e))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(root.display().to_string()));
        }
        Ok(Self { root })
    }
}

fn seconds(secs: i64, nanos: i64) -> f64 {
    secs as f64 + nanos as f64 / 1_000_000_000.0
}

fn file_time(time: f64) -> FileTime {
    let secs = time.floor();
    FileTime::from_unix_time(secs as i64, ((time - secs) * 1_000_000_000.0) as u32)
}

/// Content type from magic bytes, then the extension, then a UTF-8 check.
fn sniff(real: &Path, head: &[u8]) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    if let Some(guess) = mime_guess::from_path(real).first_raw() {
        return guess.to_string();
    }
    match std::str::from_utf8(head) {
        Ok(_) => "text/plain".to_string(),
        // a multi-byte character cut by the sniff window
        Err(e) if e.error_len().is_none() => "text/plain".to_string(),
        Err(_) => DEFAULT_TYPE.to_string(),
    }
}

impl RealFs for LocalFs {
    fn root(&self) -> &Path {
        &self.root
    }

    fn real_path(&self, entry_path: &str) -> PathBuf {
        let normalized = path::normalize(entry_path);
        self.root.join(normalized.trim_start_matches('/'))
    }

    fn lstat(&self, entry_path: &str) -> Result<RealStat> {
        let real = self.real_path(entry_path);
        let meta = fs::symlink_metadata(&real).map_err(|e| Error::io("lstat", &real, e))?;
        Ok(RealStat {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            atime: seconds(meta.atime(), meta.atime_nsec()),
            mtime: seconds(meta.mtime(), meta.mtime_nsec()),
            ctime: seconds(meta.ctime(), meta.ctime_nsec()),
            nlink: meta.nlink(),
            blocks: meta.blocks(),
        })
    }

    fn mkdir(&self, entry_path: &str, mode: u32) -> Result<()> {
        let real = self.real_path(entry_path);
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(&real)
            .map_err(|e| Error::io("mkdir", &real, e))
    }

    fn rmdir(&self, entry_path: &str) -> Result<()> {
        let real = self.real_path(entry_path);
        fs::remove_dir(&real).map_err(|e| Error::io("rmdir", &real, e))
    }

    fn rmtree(&self, entry_path: &str) -> Result<()> {
        let real = self.real_path(entry_path);
        fs::remove_dir_all(&real).map_err(|e| Error::io("rmtree", &real, e))
    }

    fn unlink(&self, entry_path: &str) -> Result<()> {
        let real = self.real_path(entry_path);
        fs::remove_file(&real).map_err(|e| Error::io("unlink", &real, e))
    }

    /// Absolute targets are overlay paths and are stored relative to the mount point.
    fn symlink(&self, target: &str, entry_path: &str) -> Result<()> {
        let real = self.real_path(entry_path);
        let real_target = if target.starts_with('/') {
            self.real_path(target)
        } else {
            PathBuf::from(target)
        };
        std::os::unix::fs::symlink(&real_target, &real).map_err(|e| Error::io("symlink", &real, e))
    }

    fn readlink(&self, entry_path: &str) -> Result<String> {
        let real = self.real_path(entry_path);
        let target = fs::read_link(&real).map_err(|e| Error::io("readlink", &real, e))?;
        Ok(match target.strip_prefix(&self.root) {
            Ok(inside) => format!("/{}", inside.to_string_lossy()),
            _ => target.to_string_lossy().into_owned(),
        })
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (from, to) = (self.real_path(old), self.real_path(new));
        fs::rename(&from, &to).map_err(|e| Error::io("rename", &from, e))
    }

    fn chmod(&self, entry_path: &str, mode: u32) -> Result<()> {
        let real = self.real_path(entry_path);
        fs::set_permissions(&real, Permissions::from_mode(mode & 0o7777))
            .map_err(|e| Error::io("chmod", &real, e))
    }

    fn chown(&self, entry_path: &str, uid: u32, gid: u32) -> Result<()> {
        let real = self.real_path(entry_path);
        std::os::unix::fs::lchown(&real, Some(uid), Some(gid)).map_err(|e| Error::io("chown", &real, e))
    }

    fn utime(&self, entry_path: &str, atime: f64, mtime: f64) -> Result<()> {
        let real = self.real_path(entry_path);
        filetime::set_symlink_file_times(&real, file_time(atime), file_time(mtime))
            .map_err(|e| Error::io("utime", &real, e))
    }

    fn truncate(&self, entry_path: &str, size: u64) -> Result<()> {
        let real = self.real_path(entry_path);
        OpenOptions::new()
            .write(true)
            .open(&real)
            .and_then(|file| file.set_len(size))
            .map_err(|e| Error::io("truncate", &real, e))
    }

    fn open(&self, entry_path: &str, flags: i32, mode: u32) -> Result<Box<dyn ByteStream>> {
        let real = self.real_path(entry_path);
        let access = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .custom_flags(flags & !libc::O_ACCMODE)
            .mode(mode & 0o7777)
            .open(&real)
            .map_err(|e| Error::io("open", &real, e))?;
        Ok(Box::new(file))
    }

    fn mime_type(&self, entry_path: &str) -> Result<String> {
        let real = self.real_path(entry_path);
        let meta = fs::symlink_metadata(&real).map_err(|e| Error::io("lstat", &real, e))?;
        if meta.is_dir() {
            return Ok(DIRECTORY_TYPE.to_string());
        }
        if meta.file_type().is_symlink() {
            return Ok(SYMLINK_TYPE.to_string());
        }
        if meta.len() == 0 {
            return Ok(EMPTY_TYPE.to_string());
        }
        let mut head = Vec::new();
        File::open(&real)
            .and_then(|file| file.take(SNIFF_LEN).read_to_end(&mut head))
            .map_err(|e| Error::io("read", &real, e))?;
        Ok(sniff(&real, &head))
    }

    fn set_acl(&self, entry_path: &str, acl: &Acl) -> Result<()> {
        let data = acl.to_binary()?;
        self.setxattr(entry_path, ACL_XATTR, &data)
    }

    fn get_acl(&self, entry_path: &str) -> Result<Option<Acl>> {
        match self.getxattr(entry_path, ACL_XATTR)? {
            Some(data) => Ok(Some(Acl::from_binary(&data)?)),
            None => Ok(None),
        }
    }

    fn setxattr(&self, entry_path: &str, key: &str, value: &[u8]) -> Result<()> {
        let real = self.real_path(entry_path);
        xattr::set(&real, key, value).map_err(|e| Error::io("setxattr", &real, e))
    }

    fn getxattr(&self, entry_path: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let real = self.real_path(entry_path);
        xattr::get(&real, key).map_err(|e| Error::io("getxattr", &real, e))
    }

    fn removexattr(&self, entry_path: &str, key: &str) -> Result<()> {
        let real = self.real_path(entry_path);
        xattr::remove(&real, key).map_err(|e| Error::io("removexattr", &real, e))
    }
}
