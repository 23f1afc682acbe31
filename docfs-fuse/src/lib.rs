use docfs_core::document::{Stats, S_IFDIR, S_IFLNK, S_IFMT};
use docfs_core::path;
use docfs_core::{Error, Identity, Overlay, OverlayFile};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{EEXIST, EINVAL, EIO, ENOENT, ERANGE};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;
const RENAME_NOREPLACE: u32 = 1;

/// Kernel error number for an overlay error.
pub fn errno(err: &Error) -> i32 {
    use docfs_core::error::FriendshipError;
    match err {
        Error::NotFound(_) => ENOENT,
        Error::AlreadyExists(_) => EEXIST,
        Error::PermissionDenied(_) => libc::EACCES,
        Error::NotADirectory(_) => libc::ENOTDIR,
        Error::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
        Error::NoAttribute { .. } => libc::ENODATA,
        Error::Conflict { .. } => libc::EAGAIN,
        Error::Friendship(FriendshipError::BlockedUser(_)) => libc::EPERM,
        Error::Acl(_) | Error::Friendship(_) | Error::UnknownUser(_) => EINVAL,
        Error::Io { source, .. } => source.raw_os_error().unwrap_or(EIO),
        Error::PartialWrite { .. } | Error::Serialization(_) | Error::Store(_) => EIO,
    }
}

/// Inode numbers handed to the kernel, kept in both directions.
#[derive(Debug)]
pub struct InodeTable {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.paths.insert(ROOT_INO, "/".to_string());
        table.inodes.insert("/".to_string(), ROOT_INO);
        table
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    /// The inode of `entry_path`, assigning a new one on first sight.
    pub fn ino(&mut self, entry_path: &str) -> u64 {
        if let Some(ino) = self.inodes.get(entry_path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, entry_path.to_string());
        self.inodes.insert(entry_path.to_string(), ino);
        ino
    }

    /// Move `old` and everything below it to `new`, keeping their inodes.
    pub fn rename(&mut self, old: &str, new: &str) {
        self.forget(new);
        let moved: Vec<(String, u64)> = self
            .inodes
            .iter()
            .filter(|(p, _)| path::is_under(p, old))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (from, ino) in moved {
            let to = format!("{}{}", new, &from[old.len()..]);
            self.inodes.remove(&from);
            self.inodes.insert(to.clone(), ino);
            self.paths.insert(ino, to);
        }
    }

    /// Drop `entry_path` and everything below it.
    pub fn forget(&mut self, entry_path: &str) {
        if entry_path == "/" {
            return;
        }
        self.inodes.retain(|p, ino| {
            let keep = !path::is_under(p, entry_path);
            if !keep {
                self.paths.remove(ino);
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn system_time(secs: f64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs_f64(secs.max(0.0))
}

fn epoch_secs(time: TimeOrNow) -> f64 {
    let time = match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    };
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn file_attr(ino: u64, stats: &Stats) -> FileAttr {
    let kind = match stats.mode & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    };
    FileAttr {
        ino,
        size: stats.size,
        blocks: stats.blocks,
        atime: system_time(stats.atime),
        mtime: system_time(stats.mtime),
        ctime: system_time(stats.ctime),
        crtime: system_time(stats.ctime),
        kind,
        perm: (stats.mode & 0o7777) as u16,
        nlink: stats.nlink,
        uid: stats.uid,
        gid: stats.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// FUSE front end of an [`Overlay`].
pub struct DocFs {
    overlay: Overlay,
    inodes: InodeTable,
    handles: HashMap<u64, OverlayFile>,
    next_fh: u64,
}

impl DocFs {
    pub fn new(overlay: Overlay) -> Self {
        Self {
            overlay,
            inodes: InodeTable::new(),
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn identity(&self, req: &Request<'_>) -> Identity {
        let login = self
            .overlay
            .directory()
            .login_for(req.uid())
            .unwrap_or_else(|| req.uid().to_string());
        Identity::new(login, req.uid(), req.gid())
    }

    fn path(&self, ino: u64) -> Result<String, i32> {
        self.inodes.path(ino).map(str::to_string).ok_or(ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let name = name.to_str().ok_or(EINVAL)?;
        Ok(path::join(&self.path(parent)?, name))
    }

    fn entry(&mut self, entry_path: &str) -> Result<FileAttr, i32> {
        let doc = self.overlay.stat(entry_path).map_err(|e| errno(&e))?;
        Ok(file_attr(self.inodes.ino(entry_path), &doc.stats))
    }

    /// Attributes of `ino`, from its document or from the real entry of a file still being created.
    fn attr(&self, ino: u64) -> Result<FileAttr, i32> {
        let entry_path = self.path(ino)?;
        match self.overlay.stat(&entry_path) {
            Ok(doc) => Ok(file_attr(ino, &doc.stats)),
            Err(Error::NotFound(_)) => self.unreleased_attr(ino, &entry_path),
            Err(e) => Err(errno(&e)),
        }
    }

    /// A created file gets its document on release. Until then an open handle vouches for it
    /// and the real entry answers, owned by whoever created it.
    fn unreleased_attr(&self, ino: u64, entry_path: &str) -> Result<FileAttr, i32> {
        let owner = self
            .handles
            .values()
            .find(|file| file.path() == entry_path && !file.is_closed())
            .map(|file| (file.identity().uid, file.identity().gid))
            .ok_or(ENOENT)?;
        let stat = self.overlay.realfs().lstat(entry_path).map_err(|e| errno(&e))?;
        let mut stats = Stats::from(&stat);
        (stats.uid, stats.gid) = owner;
        Ok(file_attr(ino, &stats))
    }

    fn add_handle(&mut self, file: OverlayFile) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, file);
        fh
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &mut self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr, i32> {
        let entry_path = self.path(ino)?;
        let fail = |e: Error| errno(&e);
        let mut doc = match self.overlay.stat(&entry_path) {
            Ok(doc) => doc,
            Err(Error::NotFound(_)) => {
                let current = self.unreleased_attr(ino, &entry_path)?;
                let realfs = self.overlay.realfs().clone();
                if let Some(mode) = mode {
                    realfs.chmod(&entry_path, mode & 0o7777).map_err(fail)?;
                }
                if uid.is_some() || gid.is_some() {
                    let (uid, gid) = (uid.unwrap_or(current.uid), gid.unwrap_or(current.gid));
                    realfs.chown(&entry_path, uid, gid).map_err(fail)?;
                }
                if let Some(size) = size {
                    realfs.truncate(&entry_path, size).map_err(fail)?;
                }
                if atime.is_some() || mtime.is_some() {
                    let atime = epoch_secs(atime.unwrap_or(TimeOrNow::SpecificTime(current.atime)));
                    let mtime = epoch_secs(mtime.unwrap_or(TimeOrNow::SpecificTime(current.mtime)));
                    realfs.utime(&entry_path, atime, mtime).map_err(fail)?;
                }
                return self.unreleased_attr(ino, &entry_path);
            }
            Err(e) => return Err(fail(e)),
        };
        if let Some(mode) = mode {
            doc = self.overlay.chmod(&entry_path, mode).map_err(fail)?;
        }
        if uid.is_some() || gid.is_some() {
            let (uid, gid) = (uid.unwrap_or(doc.stats.uid), gid.unwrap_or(doc.stats.gid));
            doc = self.overlay.chown(&entry_path, uid, gid).map_err(fail)?;
        }
        if let Some(size) = size {
            doc = self.overlay.truncate(&entry_path, size).map_err(fail)?;
        }
        if atime.is_some() || mtime.is_some() {
            let atime = atime.map(epoch_secs).unwrap_or(doc.stats.atime);
            let mtime = mtime.map(epoch_secs).unwrap_or(doc.stats.mtime);
            doc = self.overlay.utime(&entry_path, Some((atime, mtime))).map_err(fail)?;
        }
        Ok(file_attr(ino, &doc.stats))
    }
}

impl Filesystem for DocFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let attr = self.child(parent, name).and_then(|child| self.entry(&child));
        match attr {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.apply_setattr(ino, mode, uid, gid, size, atime, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Ok(entry_path) = self.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.overlay.readlink(&entry_path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let ctx = self.identity(req);
        let created = self.child(parent, name).and_then(|child| {
            self.overlay
                .mkdir(&ctx, &child, mode & !umask)
                .map_err(|e| errno(&e))?;
            self.entry(&child)
        });
        match created {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let removed = self.child(parent, name).and_then(|child| {
            self.overlay.unlink(&child, false).map_err(|e| errno(&e))?;
            self.inodes.forget(&child);
            Ok(())
        });
        match removed {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let removed = self.child(parent, name).and_then(|child| {
            self.overlay.rmdir(&child, false, false).map_err(|e| errno(&e))?;
            self.inodes.forget(&child);
            Ok(())
        });
        match removed {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn symlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, link: &Path, reply: ReplyEntry) {
        let ctx = self.identity(req);
        let Some(target) = link.to_str() else {
            reply.error(EINVAL);
            return;
        };
        let created = self.child(parent, name).and_then(|child| {
            self.overlay.symlink(&ctx, target, &child).map_err(|e| errno(&e))?;
            self.entry(&child)
        });
        match created {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let renamed = self.child(parent, name).and_then(|old| {
            let new = self.child(newparent, newname)?;
            // the kernel names the exact target; a directory there is not a destination folder
            if let Some(target) = self.overlay.get(&new).map_err(|e| errno(&e))? {
                if target.is_dir() {
                    return Err(EEXIST);
                }
            }
            let overwrite = flags & RENAME_NOREPLACE == 0;
            self.overlay.rename(&old, &new, overwrite).map_err(|e| errno(&e))?;
            self.inodes.rename(&old, &new);
            Ok(())
        });
        match renamed {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ctx = self.identity(req);
        let Ok(entry_path) = self.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.overlay.open(&ctx, &entry_path, flags, 0) {
            Ok(file) => {
                let fh = self.add_handle(file);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let ctx = self.identity(req);
        let opened = self.child(parent, name).and_then(|child| {
            let file = self
                .overlay
                .open(&ctx, &child, flags | libc::O_CREAT, mode & !umask)
                .map_err(|e| errno(&e))?;
            let ino = self.inodes.ino(&child);
            let fh = self.add_handle(file);
            match self.unreleased_attr(ino, &child) {
                Ok(attr) => Ok((attr, fh)),
                Err(code) => {
                    self.handles.remove(&fh);
                    Err(code)
                }
            }
        });
        match opened {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(file) = self.handles.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut data = Vec::with_capacity(size as usize);
        let result = file
            .seek(SeekFrom::Start(offset.max(0) as u64))
            .and_then(|_| std::io::Read::by_ref(file).take(u64::from(size)).read_to_end(&mut data));
        match result {
            Ok(_) => reply.data(&data),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(file) = self.handles.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let append = file.flags() & libc::O_APPEND != 0;
        let position = if append {
            SeekFrom::End(0)
        } else {
            SeekFrom::Start(offset.max(0) as u64)
        };
        match file.seek(position).and_then(|_| file.write_all(data)) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(mut file) = self.handles.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match file.close() {
            Ok(docs) => {
                debug!(path = %file.path(), documents = docs.len(), "released");
                reply.ok();
            }
            Err(e) => {
                warn!(path = %file.path(), error = %e, "close failed");
                reply.error(errno(&e));
            }
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Ok(dir) = self.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let children = match self.overlay.listdir(&dir) {
            Ok(children) => children,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };
        let parent_ino = self.inodes.ino(path::dirname(&dir));
        let mut entries = vec![
            (ino, FileType::Directory, String::from(".")),
            (parent_ino, FileType::Directory, String::from("..")),
        ];
        for child in children {
            let child_ino = self.inodes.ino(&child.path());
            entries.push((child_ino, file_attr(child_ino, &child.stats).kind, child.filename));
        }
        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let ctx = self.identity(req);
        let (Ok(entry_path), Some(key)) = (self.path(ino), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        match self.overlay.setxattr(&ctx, &entry_path, key, value) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let (Ok(entry_path), Some(key)) = (self.path(ino), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        match self.overlay.getxattr(&entry_path, key) {
            Ok(value) => reply_xattr(reply, size, &value),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Ok(entry_path) = self.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.overlay.listxattr(&entry_path) {
            Ok(keys) => {
                let mut names = Vec::new();
                for key in keys {
                    names.extend_from_slice(key.as_bytes());
                    names.push(0);
                }
                reply_xattr(reply, size, &names);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = self.identity(req);
        let (Ok(entry_path), Some(key)) = (self.path(ino), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        match self.overlay.removexattr(&ctx, &entry_path, key) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }
}

/// A zero `size` asks for the length only.
fn reply_xattr(reply: ReplyXattr, size: u32, value: &[u8]) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() <= size as usize {
        reply.data(value);
    } else {
        reply.error(ERANGE);
    }
}
