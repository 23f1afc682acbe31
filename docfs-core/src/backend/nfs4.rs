use super::{ByteStream, LocalFs, RealFs, RealStat};
use crate::acl::Acl;
use crate::error::{Error, Result};
use crate::identity::UserDirectory;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::debug;

const SETFACL: &str = "nfs4_setfacl";

/// A local path on an NFSv4 mount.
///
/// POSIX ACLs are translated to NFSv4 ACEs and applied with `nfs4_setfacl`. The server
/// does not expose user extended attributes, so raw attribute calls are accepted and dropped.
pub struct Nfs4Fs {
    inner: LocalFs,
    directory: Arc<dyn UserDirectory>,
    domain: String,
}

impl Nfs4Fs {
    pub fn new(inner: LocalFs, directory: Arc<dyn UserDirectory>, domain: impl Into<String>) -> Self {
        Self {
            inner,
            directory,
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl RealFs for Nfs4Fs {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn real_path(&self, path: &str) -> PathBuf {
        self.inner.real_path(path)
    }

    fn lstat(&self, path: &str) -> Result<RealStat> {
        self.inner.lstat(path)
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.inner.mkdir(path, mode)
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.inner.rmdir(path)
    }

    fn rmtree(&self, path: &str) -> Result<()> {
        self.inner.rmtree(path)
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.inner.unlink(path)
    }

    fn symlink(&self, target: &str, path: &str) -> Result<()> {
        self.inner.symlink(target, path)
    }

    fn readlink(&self, path: &str) -> Result<String> {
        self.inner.readlink(path)
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.inner.rename(old, new)
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.inner.chmod(path, mode)
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.inner.chown(path, uid, gid)
    }

    fn utime(&self, path: &str, atime: f64, mtime: f64) -> Result<()> {
        self.inner.utime(path, atime, mtime)
    }

    fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.inner.truncate(path, size)
    }

    fn open(&self, path: &str, flags: i32, mode: u32) -> Result<Box<dyn ByteStream>> {
        self.inner.open(path, flags, mode)
    }

    fn mime_type(&self, path: &str) -> Result<String> {
        self.inner.mime_type(path)
    }

    fn set_acl(&self, path: &str, acl: &Acl) -> Result<()> {
        let mut complete = acl.clone();
        complete.check(true)?;
        let text = complete.to_nfs4(self.directory.as_ref(), &self.domain)?;
        let real = self.real_path(path);
        debug!(path, entries = complete.entries().len(), "applying nfs4 acl");

        let mut child = Command::new(SETFACL)
            .arg("-S")
            .arg("-")
            .arg(&real)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io("nfs4_setfacl", &real, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| Error::io("nfs4_setfacl", &real, e))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| Error::io("nfs4_setfacl", &real, e))?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::io("nfs4_setfacl", &real, io::Error::new(io::ErrorKind::Other, message)));
        }
        Ok(())
    }

    fn get_acl(&self, _path: &str) -> Result<Option<Acl>> {
        Ok(None)
    }

    fn setxattr(&self, _path: &str, _key: &str, _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn getxattr(&self, _path: &str, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn removexattr(&self, _path: &str, _key: &str) -> Result<()> {
        Ok(())
    }
}
