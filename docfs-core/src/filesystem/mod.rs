//! Filesystem operations over a real backend and the metadata store.
//!
//! Every operation has one of three shapes:
//!
//! - Create: make the real entry, store its document with the observed stat, then
//!   refresh the parent directory's document.
//! - Read: answer from documents only, through the metadata cache.
//! - Update: apply the change to the real entry (skipped when the overlay is
//!   metadata-only), then fetch, modify and store the document.
//!
//! The real mutation always happens before the document mutation. Each operation primes
//! or invalidates the cache for every path it touched before returning, under the cache's
//! fill gate so that a concurrent miss cannot cache an older document afterwards.

mod file;
mod locks;
mod virtual_dirs;
mod walk;

pub use file::OverlayFile;
pub use locks::{PathGuard, PathLocks};
pub use virtual_dirs::VirtualDirs;
pub use walk::{Walk, WalkEntry};

use crate::acl::{parse_share_flags, Ace, AceKind, Acl, UserGrant, ACL_DEFAULT_XATTR, ACL_XATTR, UNQUALIFIED};
use crate::backend::{self, RealFs};
use crate::cache::MetadataCache;
use crate::config::OverlayConfig;
use crate::document::{Stats, SyncDocument, XattrValue, DIRECTORY_TYPE, S_IFMT, SYMLINK_TYPE};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::identity::{Identity, UserDirectory};
use crate::path;
use crate::sharing::{Friends, GrantDecision};
use crate::storage::{DocHelper, DocumentStore, LocalStore};
use crate::views::{SyncViews, ViewRegistry};
use chrono::Utc;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn os_error(op: &'static str, entry_path: &str, code: i32) -> Error {
    Error::io(op, entry_path, io::Error::from_raw_os_error(code))
}

/// Mode with its other digit taken from the ACL's other entry.
///
/// Owner and group digits stay as chmod left them; with named entries the group class is
/// governed by the ACL mask instead.
fn mode_from_acl(mode: u32, acl: &Acl) -> u32 {
    match acl.get(AceKind::Other, UNQUALIFIED) {
        Some(ace) => (mode & !0o7) | (u32::from(ace.perms) & 0o7),
        None => mode,
    }
}

/// One mounted overlay. Clones share the store, the backend and the cache.
#[derive(Clone)]
pub struct Overlay {
    config: Arc<OverlayConfig>,
    realfs: Arc<dyn RealFs>,
    docs: DocHelper<SyncDocument>,
    views: SyncViews,
    friends: Friends,
    directory: Arc<dyn UserDirectory>,
    cache: Arc<MetadataCache>,
    locks: Arc<PathLocks>,
    events: EventBus,
}

impl Overlay {
    /// Open the store and backend named by `config`.
    pub fn from_config(config: OverlayConfig) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = Arc::new(LocalStore::open(config.store_dir.clone())?);
        let directory: Arc<dyn UserDirectory> = Arc::new(config.directory());
        let realfs = backend::open(
            config.backend,
            config.mount_point.clone(),
            directory.clone(),
            &config.nfs4_domain,
        )?;
        Self::with_parts(config, store, realfs, directory)
    }

    pub fn with_parts(
        config: OverlayConfig,
        store: Arc<dyn DocumentStore>,
        realfs: Arc<dyn RealFs>,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self> {
        let registry = ViewRegistry::standard();
        let events = EventBus::new();
        let views = SyncViews::new(store.clone(), &registry)?;
        let friends = Friends::new(store.clone(), &registry, events.clone(), config.public_login.clone())?;
        info!(
            mount_point = %config.mount_point.display(),
            backend = ?config.backend,
            caching = config.caching,
            metadata_only = config.metadata_only,
            "overlay ready"
        );
        Ok(Self {
            cache: Arc::new(MetadataCache::new(config.cache_ttl())),
            config: Arc::new(config),
            realfs,
            docs: DocHelper::new(store),
            views,
            friends,
            directory,
            locks: Arc::new(PathLocks::new()),
            events,
        })
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn realfs(&self) -> &Arc<dyn RealFs> {
        &self.realfs
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        self.docs.store()
    }

    pub fn views(&self) -> &SyncViews {
        &self.views
    }

    pub fn friends(&self) -> &Friends {
        &self.friends
    }

    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn virtual_dirs(&self) -> VirtualDirs {
        VirtualDirs::new(self.views.clone(), self.friends.clone(), self.directory.clone())
    }

    fn uid_for(&self, login: &str) -> Result<u32> {
        self.directory
            .uid_for(login)
            .ok_or_else(|| Error::UnknownUser(login.to_string()))
    }

    fn remember(&self, entry_path: &str, doc: Option<SyncDocument>) {
        if self.config.caching {
            self.cache.put(entry_path, doc);
        }
    }

    fn prime(&self, docs: &[SyncDocument]) {
        if self.config.caching {
            self.cache.prime(docs);
        }
    }

    /// Run a store write and its cache updates without a concurrent fill in between.
    fn gated<T>(&self, write: impl FnOnce() -> Result<T>) -> Result<T> {
        let _gate = self.cache.gate();
        write()
    }

    /// Run a real mutation unless the overlay only tracks metadata.
    fn apply_real(&self, change: impl FnOnce(&dyn RealFs) -> Result<()>) -> Result<()> {
        if self.config.metadata_only {
            return Ok(());
        }
        change(self.realfs.as_ref())
    }

    fn root(&self) -> Result<SyncDocument> {
        let stat = self.realfs.lstat("/")?;
        Ok(SyncDocument::root(Stats::from(&stat)))
    }

    // Read

    /// The document at `entry_path`, if any. The root is synthesized from the real mount point.
    pub fn get(&self, entry_path: &str) -> Result<Option<SyncDocument>> {
        let entry_path = path::normalize(entry_path);
        if entry_path == "/" {
            return self.root().map(Some);
        }
        if !self.config.caching {
            return self.views.path(&entry_path);
        }
        self.cache.get_or_fetch(&entry_path, || self.views.path(&entry_path))
    }

    pub fn stat(&self, entry_path: &str) -> Result<SyncDocument> {
        self.get(entry_path)?
            .ok_or_else(|| Error::NotFound(path::normalize(entry_path)))
    }

    pub fn exists(&self, entry_path: &str) -> Result<bool> {
        Ok(self.get(entry_path)?.is_some())
    }

    fn require_dir(&self, entry_path: &str) -> Result<SyncDocument> {
        let doc = self.stat(entry_path)?;
        if !doc.is_dir() {
            return Err(Error::NotADirectory(doc.path()));
        }
        Ok(doc)
    }

    /// Entries of a directory, by filename.
    pub fn listdir(&self, entry_path: &str) -> Result<Vec<SyncDocument>> {
        let dir = self.require_dir(entry_path)?;
        let mut children = self.gated(|| {
            let children = self.views.children(&dir.path())?;
            self.prime(&children);
            Ok(children)
        })?;
        children.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(children)
    }

    /// Depth-first traversal of the documents below `entry_path`.
    pub fn walk(&self, entry_path: &str, topdown: bool, followlinks: bool) -> Walk<'_> {
        Walk::new(self, &path::normalize(entry_path), topdown, followlinks)
    }

    /// Bytes used by an entry, summed over the whole subtree for a directory.
    pub fn du(&self, entry_path: &str) -> Result<u64> {
        let doc = self.stat(entry_path)?;
        if !doc.is_dir() {
            return Ok(doc.stats.size);
        }
        self.views.size_under(&doc.path())
    }

    /// Entries whose filename ends with `keyword`, ignoring case.
    pub fn search(&self, keyword: &str) -> Result<Vec<SyncDocument>> {
        self.views.search(keyword)
    }

    pub fn readlink(&self, entry_path: &str) -> Result<String> {
        let doc = self.stat(entry_path)?;
        if !doc.is_symlink() {
            return Err(os_error("readlink", &doc.path(), libc::EINVAL));
        }
        self.realfs.readlink(&doc.path())
    }

    // Create

    /// Store the document of a real entry that has none yet.
    fn insert(&self, owner: Option<&Identity>, entry_path: &str, mime_type: String) -> Result<SyncDocument> {
        let stat = self.realfs.lstat(entry_path)?;
        let mut stats = Stats::from(&stat);
        if let Some(ctx) = owner {
            stats.uid = ctx.uid;
            stats.gid = ctx.gid;
        }
        let doc = self.gated(|| {
            let doc = self.docs.create(&SyncDocument::new(entry_path, mime_type, stats))?;
            self.prime(std::slice::from_ref(&doc));
            Ok(doc)
        })?;
        self.events.send(Event::Created {
            path: entry_path.to_string(),
        });
        Ok(doc)
    }

    /// Copy the real stat of `entry_path`'s parent into its document.
    fn refresh_parent(&self, entry_path: &str) -> Result<Option<SyncDocument>> {
        let parent = path::dirname(entry_path);
        if parent == "/" {
            return Ok(None);
        }
        let Some(mut doc) = self.get(parent)? else {
            return Ok(None);
        };
        let stat = self.realfs.lstat(parent)?;
        doc.stats.size = stat.size;
        doc.stats.atime = stat.atime;
        doc.stats.mtime = stat.mtime;
        doc.stats.ctime = stat.ctime;
        doc.stats.blocks = stat.blocks;
        let doc = self.gated(|| {
            let doc = self.docs.update(&doc)?;
            self.prime(std::slice::from_ref(&doc));
            Ok(doc)
        })?;
        Ok(Some(doc))
    }

    fn record_created(&self, owner: &Identity, entry_path: &str, mime_type: String) -> Result<Vec<SyncDocument>> {
        let mut touched = vec![self.insert(Some(owner), entry_path, mime_type)?];
        touched.extend(self.refresh_parent(entry_path)?);
        Ok(touched)
    }

    pub fn mkdir(&self, ctx: &Identity, entry_path: &str, mode: u32) -> Result<Vec<SyncDocument>> {
        let entry_path = path::normalize(entry_path);
        debug!(path = %entry_path, mode = %format!("{:o}", mode), "mkdir");
        self.require_dir(path::dirname(&entry_path))?;
        self.realfs.mkdir(&entry_path, mode)?;
        self.record_created(ctx, &entry_path, DIRECTORY_TYPE.to_string())
    }

    /// Create every missing directory along `entry_path`.
    ///
    /// Directories that exist on disk without a document are populated instead of created.
    pub fn makedirs(&self, ctx: &Identity, entry_path: &str, mode: u32) -> Result<Vec<SyncDocument>> {
        let entry_path = path::normalize(entry_path);
        let mut touched = Vec::new();
        let mut current = String::from("/");
        for component in entry_path.split('/').filter(|c| !c.is_empty()) {
            current = path::join(&current, component);
            match self.get(&current)? {
                Some(doc) if doc.is_dir() => continue,
                Some(doc) => return Err(Error::NotADirectory(doc.path())),
                None => {}
            }
            match self.realfs.lstat(&current) {
                Ok(stat) if stat.is_dir() => touched.extend(self.populate(&current)?),
                Ok(_) => return Err(Error::NotADirectory(current)),
                Err(e) if e.is_not_found() => touched.extend(self.mkdir(ctx, &current, mode)?),
                Err(e) => return Err(e),
            }
        }
        Ok(touched)
    }

    /// Create `link_path` pointing at `target`. Absolute targets are overlay paths.
    pub fn symlink(&self, ctx: &Identity, target: &str, link_path: &str) -> Result<Vec<SyncDocument>> {
        let link_path = path::normalize(link_path);
        debug!(path = %link_path, target, "symlink");
        self.require_dir(path::dirname(&link_path))?;
        self.realfs.symlink(target, &link_path)?;
        self.record_created(ctx, &link_path, SYMLINK_TYPE.to_string())
    }

    /// Copy a host file into the overlay at `dest`, keeping its permission bits.
    ///
    /// The copy is recorded like any other written file.
    pub fn copy(&self, ctx: &Identity, src: &Path, dest: &str) -> Result<Vec<SyncDocument>> {
        let mut source = std::fs::File::open(src).map_err(|e| Error::io("copy", src, e))?;
        let mode = source
            .metadata()
            .map_err(|e| Error::io("copy", src, e))?
            .permissions()
            .mode()
            & 0o7777;
        let mut file = self.open(ctx, dest, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, mode)?;
        io::copy(&mut source, &mut file).map_err(|e| Error::io("copy", dest, e))?;
        file.close()
    }

    /// Open the real file. Metadata is written when the returned file is closed.
    pub fn open(&self, ctx: &Identity, entry_path: &str, flags: i32, mode: u32) -> Result<OverlayFile> {
        let entry_path = path::normalize(entry_path);
        debug!(path = %entry_path, flags = %format!("{:#o}", flags), "open");
        match self.get(&entry_path)? {
            Some(doc) if doc.is_dir() && flags & libc::O_ACCMODE != libc::O_RDONLY => {
                return Err(os_error("open", &entry_path, libc::EISDIR));
            }
            None if flags & libc::O_CREAT != 0 => {
                self.require_dir(path::dirname(&entry_path))?;
            }
            _ => {}
        }
        let stream = self.realfs.open(&entry_path, flags, mode)?;
        Ok(OverlayFile::new(self.clone(), ctx.clone(), entry_path, flags, stream))
    }

    /// Bring the document in line with a file that was just written.
    pub(crate) fn close_written(&self, ctx: &Identity, entry_path: &str, flags: i32) -> Result<Vec<SyncDocument>> {
        let _guard = self.locks.lock(entry_path);
        match self.get(entry_path)? {
            Some(doc) => Ok(vec![self.refresh_content(doc)?]),
            None if flags & libc::O_CREAT != 0 => {
                let mime_type = self.realfs.mime_type(entry_path)?;
                self.record_created(ctx, entry_path, mime_type)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Create the document of an existing real entry.
    pub fn populate(&self, entry_path: &str) -> Result<Vec<SyncDocument>> {
        let entry_path = path::normalize(entry_path);
        if entry_path == "/" {
            return Ok(Vec::new());
        }
        if let Some(doc) = self.get(&entry_path)? {
            return Ok(vec![doc]);
        }
        let mime_type = self.realfs.mime_type(&entry_path)?;
        Ok(vec![self.insert(None, &entry_path, mime_type)?])
    }

    /// Populate every real entry below `entry_path` that has no document.
    pub fn populate_tree(&self, entry_path: &str) -> Result<Vec<SyncDocument>> {
        let base = path::normalize(entry_path);
        let root = self.realfs.root().to_path_buf();
        let mut created = Vec::new();
        for entry in WalkDir::new(self.realfs.real_path(&base))
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let Some(relative) = relative.to_str() else {
                warn!(path = %entry.path().display(), "skipping entry with a non utf-8 name");
                continue;
            };
            let entry_path = path::join("/", relative);
            if entry_path == "/" || self.exists(&entry_path)? {
                continue;
            }
            match self.populate(&entry_path) {
                Ok(docs) => created.extend(docs),
                Err(e) => warn!(path = %entry_path, error = %e, "could not populate entry"),
            }
        }
        info!(path = %base, created = created.len(), "populated tree");
        Ok(created)
    }

    // Update

    /// Store a modified document and cache it. The root is not stored and is re-read instead.
    fn commit(&self, doc: SyncDocument) -> Result<SyncDocument> {
        if doc.is_root() {
            return self.root();
        }
        let doc = self.gated(|| {
            let doc = self.docs.update(&doc)?;
            self.prime(std::slice::from_ref(&doc));
            Ok(doc)
        })?;
        self.events.send(Event::Updated { path: doc.path() });
        Ok(doc)
    }

    /// Pull size, times and type of a file back from its real entry.
    fn refresh_content(&self, mut doc: SyncDocument) -> Result<SyncDocument> {
        let entry_path = doc.path();
        let stat = self.realfs.lstat(&entry_path)?;
        doc.mime_type = self.realfs.mime_type(&entry_path)?;
        doc.stats.size = stat.size;
        doc.stats.atime = stat.atime;
        doc.stats.mtime = stat.mtime;
        doc.stats.ctime = stat.ctime;
        doc.stats.blocks = stat.blocks;
        doc.align_type();
        self.commit(doc)
    }

    pub fn chmod(&self, entry_path: &str, mode: u32) -> Result<SyncDocument> {
        let mut doc = self.stat(entry_path)?;
        let entry_path = doc.path();
        debug!(path = %entry_path, mode = %format!("{:o}", mode), "chmod");
        self.apply_real(|fs| fs.chmod(&entry_path, mode))?;
        doc.stats.mode = (doc.stats.mode & S_IFMT) | (mode & 0o7777);
        doc.stats.ctime = now();
        self.commit(doc)
    }

    pub fn chown(&self, entry_path: &str, uid: u32, gid: u32) -> Result<SyncDocument> {
        let mut doc = self.stat(entry_path)?;
        let entry_path = doc.path();
        debug!(path = %entry_path, uid, gid, "chown");
        self.apply_real(|fs| fs.chown(&entry_path, uid, gid))?;
        doc.stats.uid = uid;
        doc.stats.gid = gid;
        doc.stats.ctime = now();
        self.commit(doc)
    }

    /// Set access and modification times, both to now when `times` is `None`.
    pub fn utime(&self, entry_path: &str, times: Option<(f64, f64)>) -> Result<SyncDocument> {
        let mut doc = self.stat(entry_path)?;
        let entry_path = doc.path();
        let (atime, mtime) = times.unwrap_or_else(|| {
            let now = now();
            (now, now)
        });
        debug!(path = %entry_path, atime, mtime, "utime");
        self.apply_real(|fs| fs.utime(&entry_path, atime, mtime))?;
        doc.stats.atime = atime;
        doc.stats.mtime = mtime;
        self.commit(doc)
    }

    pub fn truncate(&self, entry_path: &str, size: u64) -> Result<SyncDocument> {
        let doc = self.stat(entry_path)?;
        let entry_path = doc.path();
        if doc.is_dir() {
            return Err(os_error("truncate", &entry_path, libc::EISDIR));
        }
        debug!(path = %entry_path, size, "truncate");
        let _guard = self.locks.lock(&entry_path);
        self.realfs.truncate(&entry_path, size)?;
        self.refresh_content(doc)
    }

    pub fn tag(&self, entry_path: &str, tag: &str) -> Result<SyncDocument> {
        let mut doc = self.stat(entry_path)?;
        if !doc.tag(tag) {
            return Ok(doc);
        }
        self.commit(doc)
    }

    pub fn untag(&self, entry_path: &str, tag: &str) -> Result<SyncDocument> {
        let mut doc = self.stat(entry_path)?;
        if !doc.untag(tag) {
            return Ok(doc);
        }
        self.commit(doc)
    }

    /// Move an entry. A directory target receives the source inside it.
    ///
    /// Renaming a directory rewrites the `dirpath` of every document below it in one batch.
    /// A batch that stops part way is reported as [`Error::PartialWrite`].
    pub fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<Vec<SyncDocument>> {
        let old = path::normalize(old);
        let mut new = path::normalize(new);
        if old == "/" {
            return Err(Error::PermissionDenied(old));
        }
        let mut doc = self.stat(&old)?;
        if let Some(target) = self.get(&new)? {
            if target.is_dir() {
                new = path::join(&new, &doc.filename);
            }
        }
        if new == old {
            return Ok(Vec::new());
        }
        if path::is_under(&new, &old) {
            return Err(os_error("rename", &new, libc::EINVAL));
        }
        debug!(from = %old, to = %new, overwrite, "rename");
        self.require_dir(path::dirname(&new))?;
        let replaced = match self.get(&new)? {
            Some(existing) if overwrite && !existing.is_dir() => Some(existing),
            Some(_) => return Err(Error::AlreadyExists(new)),
            None => None,
        };

        // the real rename replaces a file target in place
        self.realfs.rename(&old, &new)?;
        if let Some(existing) = &replaced {
            self.delete_docs(&new, std::slice::from_ref(existing))?;
        }
        doc.set_path(&new);
        doc.stats.ctime = now();
        let mut batch = vec![doc];
        if batch[0].is_dir() {
            for mut child in self.views.descendants(&old)? {
                child.dirpath = format!("{}{}", new, &child.dirpath[old.len()..]);
                batch.push(child);
            }
        }
        let updated = self.gated(|| {
            let result = self.docs.update_many(batch);
            if self.config.caching {
                self.cache.invalidate_prefix(&old);
                if result.is_err() {
                    self.cache.invalidate_prefix(&new);
                }
            }
            let updated = result?;
            self.remember(&old, None);
            self.prime(&updated);
            Ok(updated)
        })?;
        self.refresh_parent(&old)?;
        self.refresh_parent(&new)?;
        info!(from = %old, to = %new, documents = updated.len(), "renamed");
        self.events.send(Event::Renamed { from: old, to: new });
        Ok(updated)
    }

    /// Delete the documents of a removed entry and forget every cached path below it.
    fn delete_docs(&self, entry_path: &str, removed: &[SyncDocument]) -> Result<()> {
        self.gated(|| {
            let result = removed.iter().try_for_each(|doc| self.docs.delete(doc));
            if self.config.caching {
                self.cache.invalidate_prefix(entry_path);
                if result.is_ok() {
                    self.cache.put(entry_path, None);
                }
            }
            result
        })?;
        if !removed.is_empty() {
            self.events.send(Event::Deleted {
                path: entry_path.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a file or symlink. With `nodb` its document is kept.
    pub fn unlink(&self, entry_path: &str, nodb: bool) -> Result<Vec<SyncDocument>> {
        let entry_path = path::normalize(entry_path);
        debug!(path = %entry_path, nodb, "unlink");
        let doc = self.get(&entry_path)?;
        if doc.as_ref().is_some_and(SyncDocument::is_dir) {
            return Err(os_error("unlink", &entry_path, libc::EISDIR));
        }
        self.realfs.unlink(&entry_path)?;
        if nodb {
            return Ok(Vec::new());
        }
        let removed: Vec<SyncDocument> = doc.into_iter().collect();
        self.delete_docs(&entry_path, &removed)?;
        self.refresh_parent(&entry_path)?;
        Ok(removed)
    }

    /// Remove a directory. `force` removes a non-empty tree; `nodb` keeps the documents.
    pub fn rmdir(&self, entry_path: &str, nodb: bool, force: bool) -> Result<Vec<SyncDocument>> {
        let entry_path = path::normalize(entry_path);
        if entry_path == "/" {
            return Err(Error::PermissionDenied(entry_path));
        }
        debug!(path = %entry_path, nodb, force, "rmdir");
        let doc = self.get(&entry_path)?;
        if let Some(doc) = &doc {
            if !doc.is_dir() {
                return Err(Error::NotADirectory(entry_path));
            }
        }
        if force {
            self.realfs.rmtree(&entry_path)?;
        } else {
            self.realfs.rmdir(&entry_path)?;
        }
        if nodb {
            return Ok(Vec::new());
        }
        let mut removed = self.views.descendants(&entry_path)?;
        removed.extend(doc);
        self.delete_docs(&entry_path, &removed)?;
        self.refresh_parent(&entry_path)?;
        Ok(removed)
    }

    // Extended attributes and sharing

    /// Set an extended attribute. The POSIX ACL key goes through the sharing resolver.
    ///
    /// Returns the documents written, empty when nothing changed.
    pub fn setxattr(&self, ctx: &Identity, entry_path: &str, key: &str, value: &[u8]) -> Result<Vec<SyncDocument>> {
        let mut doc = self.stat(entry_path)?;
        debug!(path = %doc.path(), key, len = value.len(), "setxattr");
        if key == ACL_XATTR {
            let requested = self.decode_acl(&doc, value)?;
            return self.apply_acl(ctx, doc, requested);
        }
        if doc.xattrs.get(key).is_some_and(|current| current.0 == value) {
            return Ok(Vec::new());
        }
        if !self.config.xattrs_in_store_only {
            self.realfs.setxattr(&doc.path(), key, value)?;
        }
        doc.xattrs.insert(key.to_string(), XattrValue(value.to_vec()));
        Ok(vec![self.commit(doc)?])
    }

    pub fn getxattr(&self, entry_path: &str, key: &str) -> Result<Vec<u8>> {
        let doc = self.stat(entry_path)?;
        if key == ACL_XATTR {
            return doc.posix_acl()?.to_binary();
        }
        match doc.xattrs.get(key) {
            Some(value) => Ok(value.0.clone()),
            None if key == ACL_DEFAULT_XATTR => Acl::from_mode(0o700).to_binary(),
            None => Err(Error::NoAttribute {
                path: doc.path(),
                key: key.to_string(),
            }),
        }
    }

    /// Attribute names, with the ACL key listed when the entry has named grants.
    pub fn listxattr(&self, entry_path: &str) -> Result<Vec<String>> {
        let doc = self.stat(entry_path)?;
        let mut keys: Vec<String> = doc.xattrs.keys().cloned().collect();
        if !doc.acl.is_empty() {
            keys.push(ACL_XATTR.to_string());
        }
        keys.sort();
        Ok(keys)
    }

    /// Remove an attribute. Removing the ACL key revokes every named grant.
    pub fn removexattr(&self, ctx: &Identity, entry_path: &str, key: &str) -> Result<Vec<SyncDocument>> {
        let mut doc = self.stat(entry_path)?;
        debug!(path = %doc.path(), key, "removexattr");
        if key == ACL_XATTR {
            let plain = Acl::from_mode(doc.stats.mode);
            return self.apply_acl(ctx, doc, plain);
        }
        if doc.xattrs.remove(key).is_none() {
            return Err(Error::NoAttribute {
                path: doc.path(),
                key: key.to_string(),
            });
        }
        if !self.config.xattrs_in_store_only {
            self.realfs.removexattr(&doc.path(), key)?;
        }
        Ok(vec![self.commit(doc)?])
    }

    /// Grant `perms` on an entry to `login`.
    pub fn share(&self, ctx: &Identity, entry_path: &str, login: &str, perms: u16) -> Result<Vec<SyncDocument>> {
        let doc = self.stat(entry_path)?;
        let uid = self.uid_for(login)?;
        let mut acl = doc.posix_acl()?;
        acl.push(Ace::user(uid, perms));
        self.apply_acl(ctx, doc, acl)
    }

    /// Accept a friend request and apply the shares that waited on it.
    pub fn accept_friend(&self, ctx: &Identity, login: &str) -> Result<Vec<SyncDocument>> {
        let uid = self.uid_for(login)?;
        let (_, pending) = self.friends.accept_friend(ctx, login)?;
        let mut touched = Vec::new();
        for (doc_id, flags) in pending {
            let Some(doc) = self.docs.get(&doc_id)? else {
                warn!(doc = %doc_id, friend = login, "shared document no longer exists");
                continue;
            };
            let mut acl = doc.posix_acl()?;
            acl.push(Ace::user(uid, parse_share_flags(&flags)));
            touched.extend(self.apply_acl(ctx, doc, acl)?);
        }
        Ok(touched)
    }

    /// Read an ACL attribute value: the binary layout, or a JSON list of grants by login.
    ///
    /// The JSON form replaces every named-user entry and keeps the mode-derived ones.
    fn decode_acl(&self, doc: &SyncDocument, value: &[u8]) -> Result<Acl> {
        let mut acl = match Acl::from_binary(value) {
            Ok(acl) => acl,
            Err(binary_err) => {
                let Ok(grants) = serde_json::from_slice::<Vec<UserGrant>>(value) else {
                    return Err(binary_err);
                };
                let mut acl = Acl::from_mode(doc.stats.mode);
                for grant in grants {
                    let uid = match self.directory.uid_for(&grant.user) {
                        Some(uid) => uid,
                        None => grant
                            .user
                            .parse()
                            .map_err(|_| Error::UnknownUser(grant.user.clone()))?,
                    };
                    acl.push(Ace::user(uid, grant.perms()));
                }
                acl
            }
        };
        acl.set_mode(doc.stats.mode);
        acl.check(true)?;
        Ok(acl)
    }

    /// Replace an entry's ACL with `requested`, gating every new named-user grant.
    ///
    /// Grants to users without an established relationship are deferred and left out of
    /// the ACL. A blocked grantee fails the whole call before anything is written. When
    /// the result equals the current ACL nothing is stored.
    fn apply_acl(&self, ctx: &Identity, mut doc: SyncDocument, mut requested: Acl) -> Result<Vec<SyncDocument>> {
        let entry_path = doc.path();
        let before = doc.posix_acl()?;
        requested.set_mode(doc.stats.mode);
        requested.check(true)?;

        let granted: Vec<Ace> = requested
            .entries()
            .iter()
            .filter(|ace| ace.kind == AceKind::User)
            .filter(|ace| before.get(AceKind::User, ace.qualifier).map(|old| old.perms) != Some(ace.perms))
            .copied()
            .collect();
        let mut logins = Vec::with_capacity(granted.len());
        for ace in &granted {
            let login = self
                .directory
                .login_for(ace.qualifier)
                .ok_or_else(|| Error::UnknownUser(ace.qualifier.to_string()))?;
            self.friends.check_grant(&login)?;
            logins.push(login);
        }

        let mut applied = Vec::new();
        for (ace, login) in granted.iter().zip(logins) {
            match self.friends.resolve_grant(ctx, &login, &doc.id, ace.perms)? {
                GrantDecision::Apply => applied.push(login),
                GrantDecision::Deferred(_) => {
                    requested.remove(AceKind::User, ace.qualifier);
                    if let Some(old) = before.get(AceKind::User, ace.qualifier) {
                        requested.push(*old);
                    }
                }
            }
        }
        requested.check(true)?;

        let mode = mode_from_acl(doc.stats.mode, &requested);
        if requested == before && mode == doc.stats.mode {
            debug!(path = %entry_path, "acl unchanged");
            return Ok(Vec::new());
        }
        let revoked: Vec<String> = before
            .named()
            .filter(|ace| ace.kind == AceKind::User && requested.get(AceKind::User, ace.qualifier).is_none())
            .map(|ace| {
                self.directory
                    .login_for(ace.qualifier)
                    .unwrap_or_else(|| ace.qualifier.to_string())
            })
            .collect();

        let mut touched = Vec::new();
        if !applied.is_empty() {
            touched.extend(self.open_ancestors(&entry_path)?);
        }
        if !self.config.xattrs_in_store_only {
            self.realfs.set_acl(&entry_path, &requested)?;
        }
        doc.acl = requested.to_json();
        doc.stats.mode = mode;
        doc.stats.ctime = now();
        let doc = self.commit(doc)?;

        for principal in applied {
            info!(path = %entry_path, grantee = %principal, "shared");
            self.events.send(Event::Shared {
                id: doc.id.clone(),
                path: entry_path.clone(),
                principal,
            });
        }
        for principal in revoked {
            info!(path = %entry_path, grantee = %principal, "unshared");
            self.events.send(Event::Unshared {
                id: doc.id.clone(),
                path: entry_path.clone(),
                principal,
            });
        }
        touched.insert(0, doc);
        Ok(touched)
    }

    /// Give every ancestor of `entry_path` the other-execute bit so grantees can reach it.
    fn open_ancestors(&self, entry_path: &str) -> Result<Vec<SyncDocument>> {
        let mut touched = Vec::new();
        for ancestor in path::ancestors(entry_path) {
            let doc = self.stat(ancestor)?;
            if doc.stats.mode & 0o001 == 0 {
                touched.push(self.chmod(ancestor, (doc.stats.mode | 0o001) & 0o7777)?);
            }
        }
        Ok(touched)
    }
}
