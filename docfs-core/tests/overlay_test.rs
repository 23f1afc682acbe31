//! End-to-end tests of the overlay over a local store and a local mount point

use anyhow::Result;
use docfs_core::acl::{Acl, AceKind, ACL_DEFAULT_XATTR, ACL_XATTR, READ};
use docfs_core::backend;
use docfs_core::document::{DIRECTORY_TYPE, S_IFMT, S_IFREG, SYMLINK_TYPE};
use docfs_core::error::Error;
use docfs_core::events::Event;
use docfs_core::sharing::FriendshipStatus;
use docfs_core::storage::{
    ChangeEvent, DocumentStore, LocalStore, Query, Record, ReduceRow, ReplicateOptions, ReplicationReport, ViewDef,
    ViewRow,
};
use docfs_core::views::BY_PATH;
use docfs_core::{Identity, Overlay, OverlayConfig, UserDirectory};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    mount: TempDir,
    _store: TempDir,
    overlay: Overlay,
    alice: Identity,
}

fn config(mount: &TempDir, store: &TempDir) -> OverlayConfig {
    let mut config = OverlayConfig::new(mount.path(), store.path());
    config.users.insert("alice".to_string(), 1000);
    config.users.insert("bob".to_string(), 1001);
    config.users.insert("carol".to_string(), 1002);
    config
}

fn setup_with(customize: impl FnOnce(&mut OverlayConfig)) -> Result<Fixture> {
    let mount = TempDir::new()?;
    let store = TempDir::new()?;
    let mut config = config(&mount, &store);
    customize(&mut config);
    let overlay = Overlay::from_config(config)?;
    Ok(Fixture {
        mount,
        _store: store,
        overlay,
        alice: Identity::new("alice", 1000, 1000),
    })
}

fn setup() -> Result<Fixture> {
    setup_with(|_| {})
}

/// Local store that can stall one path lookup, or let another writer commit a record
/// just before a batch containing it.
struct InterposedStore {
    inner: LocalStore,
    stall_lookup: AtomicBool,
    race_batch: Mutex<Option<String>>,
}

impl DocumentStore for InterposedStore {
    fn create(&self, record: Record) -> docfs_core::Result<Record> {
        self.inner.create(record)
    }

    fn get(&self, id: &str) -> docfs_core::Result<Option<Record>> {
        self.inner.get(id)
    }

    fn update(&self, records: Vec<Record>) -> docfs_core::Result<Vec<Record>> {
        let racing = {
            let mut race = self.race_batch.lock();
            let hit = records.len() > 1 && race.as_ref().is_some_and(|id| records.iter().any(|r| &r.id == id));
            if hit {
                race.take()
            } else {
                None
            }
        };
        if let Some(id) = racing {
            if let Some(current) = self.inner.get(&id)? {
                self.inner.update(vec![current])?;
            }
        }
        self.inner.update(records)
    }

    fn delete(&self, record: &Record) -> docfs_core::Result<()> {
        self.inner.delete(record)
    }

    fn query(&self, view: &str, query: &Query) -> docfs_core::Result<Vec<ViewRow>> {
        if view == BY_PATH && self.stall_lookup.swap(false, Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(300));
        }
        self.inner.query(view, query)
    }

    fn reduce(&self, view: &str, query: &Query, group_level: Option<usize>) -> docfs_core::Result<Vec<ReduceRow>> {
        self.inner.reduce(view, query, group_level)
    }

    fn changes(&self, since: u64, doctype: Option<&str>) -> docfs_core::Result<Vec<ChangeEvent>> {
        self.inner.changes(since, doctype)
    }

    fn import(&self, record: Record) -> docfs_core::Result<bool> {
        self.inner.import(record)
    }

    fn replicate(
        &self,
        target: &dyn DocumentStore,
        options: &ReplicateOptions,
    ) -> docfs_core::Result<ReplicationReport> {
        self.inner.replicate(target, options)
    }

    fn sync_views(&self, views: &[ViewDef]) -> docfs_core::Result<()> {
        self.inner.sync_views(views)
    }
}

fn setup_interposed() -> Result<(Fixture, Arc<InterposedStore>)> {
    let mount = TempDir::new()?;
    let store_dir = TempDir::new()?;
    let config = config(&mount, &store_dir);
    let store = Arc::new(InterposedStore {
        inner: LocalStore::open(store_dir.path())?,
        stall_lookup: AtomicBool::new(false),
        race_batch: Mutex::new(None),
    });
    let directory: Arc<dyn UserDirectory> = Arc::new(config.directory());
    let realfs = backend::open(config.backend, mount.path(), directory.clone(), &config.nfs4_domain)?;
    let overlay = Overlay::with_parts(config, store.clone(), realfs, directory)?;
    let fx = Fixture {
        mount,
        _store: store_dir,
        overlay,
        alice: Identity::new("alice", 1000, 1000),
    };
    Ok((fx, store))
}

fn write_file(fx: &Fixture, path: &str, content: &[u8]) -> Result<()> {
    let mut file = fx
        .overlay
        .open(&fx.alice, path, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, 0o644)?;
    file.write_all(content)?;
    file.close()?;
    Ok(())
}

#[test]
fn test_create_write_and_deferred_share() -> Result<()> {
    let fx = setup()?;
    let mut events = fx.overlay.events().subscribe();

    let created = fx.overlay.mkdir(&fx.alice, "/docs", 0o755)?;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].mime_type, DIRECTORY_TYPE);

    let mut file = fx
        .overlay
        .open(&fx.alice, "/docs/a.txt", libc::O_CREAT | libc::O_WRONLY, 0o644)?;
    file.write_all(b"hello")?;
    // the document and its parent directory
    assert_eq!(file.close()?.len(), 2);

    let doc = fx.overlay.stat("/docs/a.txt")?;
    assert_eq!(doc.stats.size, 5);
    assert_eq!(doc.mime_type, "text/plain");
    assert_eq!(doc.stats.uid, 1000);
    assert_eq!(doc.stats.mode & S_IFMT, S_IFREG);

    let grant = br#"[{"user": "bob", "privileges": ["read"]}]"#;
    let written = fx.overlay.setxattr(&fx.alice, "/docs/a.txt", ACL_XATTR, grant)?;
    assert!(written.is_empty());

    let doc = fx.overlay.stat("/docs/a.txt")?;
    assert!(doc.acl.is_empty());
    assert_eq!(doc.posix_acl()?.named().count(), 0);

    let relation = fx.overlay.friends().relation("bob")?.expect("friend request created");
    assert_eq!(relation.status, FriendshipStatus::PendingFriend);
    assert_eq!(relation.pending_shares.len(), 1);
    assert_eq!(relation.pending_shares[&doc.id], "R");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&Event::ShareDeferred {
        id: doc.id.clone(),
        principal: "bob".to_string(),
        perms: "R".to_string(),
    }));
    Ok(())
}

#[test]
fn test_accepting_friend_applies_pending_shares() -> Result<()> {
    let fx = setup()?;
    fx.overlay.mkdir(&fx.alice, "/docs", 0o755)?;
    write_file(&fx, "/docs/a.txt", b"hello")?;
    std::fs::set_permissions(fx.mount.path(), std::fs::Permissions::from_mode(0o700))?;

    fx.overlay.share(&fx.alice, "/docs/a.txt", "bob", READ)?;
    assert!(fx.overlay.stat("/docs/a.txt")?.acl.is_empty());

    let touched = fx.overlay.accept_friend(&fx.alice, "bob")?;
    assert_eq!(touched[0].path(), "/docs/a.txt");
    assert_eq!(touched[0].acl.len(), 1);

    let acl = Acl::from_binary(&fx.overlay.getxattr("/docs/a.txt", ACL_XATTR)?)?;
    assert_eq!(acl.get(AceKind::User, 1001).map(|ace| ace.perms), Some(READ));
    assert!(acl.get(AceKind::Mask, 0).is_some());

    // ancestors become traversable for the grantee
    assert_eq!(fx.overlay.stat("/")?.stats.mode & 0o001, 0o001);
    assert_eq!(std::fs::metadata(fx.mount.path())?.mode() & 0o777, 0o701);

    let relation = fx.overlay.friends().relation("bob")?.expect("relation kept");
    assert_eq!(relation.status, FriendshipStatus::Friend);
    assert!(relation.pending_shares.is_empty());
    assert_eq!(fx.overlay.views().participants(1000)?, vec![(1001, 1)]);
    assert_eq!(fx.overlay.listxattr("/docs/a.txt")?, vec![ACL_XATTR.to_string()]);

    // a second identical grant changes nothing
    assert!(fx.overlay.share(&fx.alice, "/docs/a.txt", "bob", READ)?.is_empty());

    // removing the attribute revokes the grant
    fx.overlay.removexattr(&fx.alice, "/docs/a.txt", ACL_XATTR)?;
    assert!(fx.overlay.stat("/docs/a.txt")?.acl.is_empty());
    Ok(())
}

#[test]
fn test_blocked_grant_changes_nothing() -> Result<()> {
    let fx = setup()?;
    write_file(&fx, "/a.txt", b"data")?;
    fx.overlay.share(&fx.alice, "/a.txt", "carol", READ)?;
    fx.overlay.friends().block(&fx.alice, "bob")?;

    let before = fx.overlay.stat("/a.txt")?;
    let grant = br#"[{"user": "carol", "privileges": ["read", "write"]}, {"user": "bob", "privileges": ["read"]}]"#;
    let err = fx.overlay.setxattr(&fx.alice, "/a.txt", ACL_XATTR, grant).unwrap_err();
    assert!(matches!(
        err,
        Error::Friendship(docfs_core::error::FriendshipError::BlockedUser(ref login)) if login == "bob"
    ));

    let after = fx.overlay.stat("/a.txt")?;
    assert_eq!(after.rev, before.rev);
    assert!(after.acl.is_empty());
    let carol = fx.overlay.friends().relation("carol")?.expect("pending request");
    assert_eq!(carol.pending_shares[&after.id], "R");
    let bob = fx.overlay.friends().relation("bob")?.expect("block kept");
    assert_eq!(bob.status, FriendshipStatus::BlockedUser);
    assert!(bob.pending_shares.is_empty());
    Ok(())
}

#[test]
fn test_rename_rewrites_subtree() -> Result<()> {
    let fx = setup()?;
    fx.overlay.makedirs(&fx.alice, "/a/b", 0o755)?;
    write_file(&fx, "/a/b/f.txt", b"content")?;

    let updated = fx.overlay.rename("/a", "/c", false)?;
    assert_eq!(updated.len(), 3);
    assert_eq!(fx.overlay.stat("/c/b/f.txt")?.dirpath, "/c/b");
    assert!(fx.overlay.get("/a/b/f.txt")?.is_none());
    assert!(fx.overlay.get("/a")?.is_none());
    assert!(fx.overlay.views().descendants("/a")?.is_empty());
    assert_eq!(fx.overlay.views().descendants("/c")?.len(), 2);
    assert!(fx.mount.path().join("c/b/f.txt").exists());

    // a directory target receives the source
    fx.overlay.mkdir(&fx.alice, "/d", 0o755)?;
    fx.overlay.rename("/c", "/d", false)?;
    assert_eq!(fx.overlay.stat("/d/c/b/f.txt")?.dirpath, "/d/c/b");

    write_file(&fx, "/x.txt", b"x")?;
    write_file(&fx, "/y.txt", b"yy")?;
    assert!(matches!(
        fx.overlay.rename("/x.txt", "/y.txt", false),
        Err(Error::AlreadyExists(_))
    ));
    fx.overlay.rename("/x.txt", "/y.txt", true)?;
    assert_eq!(fx.overlay.stat("/y.txt")?.stats.size, 1);
    assert!(!fx.overlay.exists("/x.txt")?);
    Ok(())
}

#[test]
fn test_unlink_and_rmdir() -> Result<()> {
    let fx = setup()?;
    fx.overlay.makedirs(&fx.alice, "/t/u", 0o755)?;
    write_file(&fx, "/t/u/f", b"1")?;
    write_file(&fx, "/t/keep", b"2")?;

    fx.overlay.unlink("/t/keep", true)?;
    assert!(fx.overlay.exists("/t/keep")?);
    assert!(!fx.mount.path().join("t/keep").exists());

    assert!(matches!(
        fx.overlay.rmdir("/t", false, false),
        Err(Error::DirectoryNotEmpty(_))
    ));
    assert!(matches!(fx.overlay.rmdir("/t/u/f", false, false), Err(Error::NotADirectory(_))));

    let removed = fx.overlay.rmdir("/t", false, true)?;
    assert_eq!(removed.len(), 4);
    assert!(!fx.overlay.exists("/t/u/f")?);
    assert!(!fx.overlay.exists("/t")?);
    assert!(fx.overlay.views().descendants("/t")?.is_empty());
    assert!(matches!(fx.overlay.unlink("/t/u/f", false), Err(Error::NotFound(_))));
    Ok(())
}

#[test]
fn test_listdir_walk_and_du() -> Result<()> {
    let fx = setup()?;
    fx.overlay.makedirs(&fx.alice, "/p/q", 0o755)?;
    fx.overlay.mkdir(&fx.alice, "/other", 0o755)?;
    write_file(&fx, "/p/b.txt", b"12345")?;
    write_file(&fx, "/p/q/c.txt", b"1234567")?;
    write_file(&fx, "/other/o.txt", b"o")?;
    fx.overlay.symlink(&fx.alice, "/other", "/p/link")?;
    assert_eq!(fx.overlay.stat("/p/link")?.mime_type, SYMLINK_TYPE);
    assert_eq!(fx.overlay.readlink("/p/link")?, "/other");

    let names: Vec<String> = fx.overlay.listdir("/p")?.into_iter().map(|d| d.filename).collect();
    assert_eq!(names, vec!["b.txt", "link", "q"]);
    assert!(matches!(fx.overlay.listdir("/p/b.txt"), Err(Error::NotADirectory(_))));

    let topdown: Vec<String> = fx
        .overlay
        .walk("/p", true, false)
        .map(|entry| entry.map(|e| e.dirpath))
        .collect::<docfs_core::Result<_>>()?;
    assert_eq!(topdown, vec!["/p", "/p/q"]);

    let bottom_up: Vec<String> = fx
        .overlay
        .walk("/p", false, false)
        .map(|entry| entry.map(|e| e.dirpath))
        .collect::<docfs_core::Result<_>>()?;
    assert_eq!(bottom_up, vec!["/p/q", "/p"]);

    let first = fx.overlay.walk("/p", true, false).next().expect("top entry")?;
    assert_eq!(first.files.len(), 2);
    assert_eq!(first.dirs.len(), 1);

    let followed: Vec<String> = fx
        .overlay
        .walk("/p", true, true)
        .map(|entry| entry.map(|e| e.dirpath))
        .collect::<docfs_core::Result<_>>()?;
    assert_eq!(followed, vec!["/p", "/other", "/p/q"]);

    let q_size = fx.overlay.stat("/p/q")?.stats.size;
    let link_size = fx.overlay.stat("/p/link")?.stats.size;
    assert_eq!(fx.overlay.du("/p")?, 5 + 7 + q_size + link_size);
    assert_eq!(fx.overlay.du("/p/b.txt")?, 5);
    Ok(())
}

#[test]
fn test_metadata_updates() -> Result<()> {
    let fx = setup()?;
    write_file(&fx, "/f", b"0123456789")?;
    let real = fx.mount.path().join("f");

    let doc = fx.overlay.chmod("/f", 0o600)?;
    assert_eq!(doc.stats.mode, S_IFREG | 0o600);
    assert_eq!(std::fs::metadata(&real)?.mode() & 0o7777, 0o600);

    let doc = fx.overlay.utime("/f", Some((10.0, 20.0)))?;
    assert_eq!((doc.stats.atime, doc.stats.mtime), (10.0, 20.0));
    assert_eq!(std::fs::metadata(&real)?.mtime(), 20);

    let meta = std::fs::metadata(&real)?;
    let doc = fx.overlay.chown("/f", meta.uid(), meta.gid())?;
    assert_eq!(doc.stats.uid, meta.uid());

    let doc = fx.overlay.truncate("/f", 3)?;
    assert_eq!(doc.stats.size, 3);
    assert_eq!(std::fs::metadata(&real)?.len(), 3);

    let doc = fx.overlay.tag("/f", "work")?;
    assert!(doc.tags.contains("work"));
    assert_eq!(fx.overlay.views().tagged("work")?.len(), 1);
    let doc = fx.overlay.untag("/f", "work")?;
    assert!(doc.tags.is_empty());
    Ok(())
}

#[test]
fn test_metadata_only_skips_real_changes() -> Result<()> {
    let fx = setup_with(|config| config.metadata_only = true)?;
    write_file(&fx, "/f", b"x")?;
    let real = fx.mount.path().join("f");
    let real_mode = std::fs::metadata(&real)?.mode() & 0o7777;

    let doc = fx.overlay.chmod("/f", 0o604)?;
    assert_eq!(doc.stats.mode & 0o7777, 0o604);
    assert_eq!(std::fs::metadata(&real)?.mode() & 0o7777, real_mode);
    Ok(())
}

#[test]
fn test_extended_attributes() -> Result<()> {
    let fx = setup()?;
    write_file(&fx, "/f", b"x")?;

    assert_eq!(fx.overlay.setxattr(&fx.alice, "/f", "user.comment", b"hi")?.len(), 1);
    assert!(fx.overlay.setxattr(&fx.alice, "/f", "user.comment", b"hi")?.is_empty());
    assert_eq!(fx.overlay.getxattr("/f", "user.comment")?, b"hi");
    assert_eq!(fx.overlay.listxattr("/f")?, vec!["user.comment".to_string()]);

    assert_eq!(
        fx.overlay.getxattr("/f", ACL_DEFAULT_XATTR)?,
        Acl::from_mode(0o700).to_binary()?
    );
    let plain = Acl::from_binary(&fx.overlay.getxattr("/f", ACL_XATTR)?)?;
    assert_eq!(plain.entries().len(), 3);

    fx.overlay.removexattr(&fx.alice, "/f", "user.comment")?;
    assert!(matches!(
        fx.overlay.getxattr("/f", "user.comment"),
        Err(Error::NoAttribute { .. })
    ));
    assert!(matches!(
        fx.overlay.removexattr(&fx.alice, "/f", "user.comment"),
        Err(Error::NoAttribute { .. })
    ));
    Ok(())
}

#[test]
fn test_open_without_writing_leaves_metadata_alone() -> Result<()> {
    let fx = setup()?;
    write_file(&fx, "/f.txt", b"abc")?;
    let before = fx.overlay.stat("/f.txt")?;

    let mut file = fx.overlay.open(&fx.alice, "/f.txt", libc::O_RDONLY, 0)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    assert_eq!(content, "abc");
    assert!(file.close()?.is_empty());
    assert!(file.close()?.is_empty());
    assert_eq!(fx.overlay.stat("/f.txt")?.rev, before.rev);

    // created but opened read-only: no document
    let file = fx.overlay.open(&fx.alice, "/g", libc::O_CREAT | libc::O_RDONLY, 0o644)?;
    drop(file);
    assert!(fx.mount.path().join("g").exists());
    assert!(!fx.overlay.exists("/g")?);

    // dropping a written file still records it
    let mut file = fx.overlay.open(&fx.alice, "/h", libc::O_CREAT | libc::O_WRONLY, 0o644)?;
    file.write_all(b"dropped")?;
    drop(file);
    assert_eq!(fx.overlay.stat("/h")?.stats.size, 7);

    assert!(matches!(
        fx.overlay.open(&fx.alice, "/missing/x", libc::O_CREAT | libc::O_WRONLY, 0o644),
        Err(Error::NotFound(_))
    ));
    Ok(())
}

#[test]
fn test_populate_tree_and_virtual_dirs() -> Result<()> {
    let fx = setup()?;
    let root = fx.mount.path();
    std::fs::create_dir_all(root.join("photos/2024"))?;
    std::fs::write(
        root.join("photos/2024/pic"),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0],
    )?;
    std::fs::write(root.join("notes.md"), "# notes")?;

    let created = fx.overlay.populate_tree("/")?;
    assert_eq!(created.len(), 4);
    assert!(fx.overlay.populate_tree("/")?.is_empty());
    assert_eq!(fx.overlay.stat("/photos/2024/pic")?.mime_type, "image/png");
    assert_eq!(fx.overlay.listdir("/photos")?.len(), 1);

    let virtual_dirs = fx.overlay.virtual_dirs();
    let categories: Vec<String> = virtual_dirs
        .categories("/.types", &fx.alice)?
        .into_iter()
        .map(|d| d.filename)
        .collect();
    assert_eq!(categories, vec!["image", "text"]);
    let subtypes = virtual_dirs.subtypes("/.types/image", &fx.alice, "image")?;
    assert_eq!(subtypes[0].path(), "/.types/image/png");
    assert_eq!(subtypes[0].stats.mode & 0o777, 0o555);
    assert_eq!(virtual_dirs.of_type("image", "png")?.len(), 1);

    assert_eq!(fx.overlay.search("PIC")?.len(), 1);
    assert!(fx.overlay.search("nothing")?.is_empty());
    Ok(())
}

#[test]
fn test_lookups_are_cached() -> Result<()> {
    let fx = setup()?;
    assert!(fx.overlay.get("/nope")?.is_none());
    assert_eq!(fx.overlay.cache().get("/nope"), Some(None));

    write_file(&fx, "/nope", b"now here")?;
    assert_eq!(fx.overlay.stat("/nope")?.stats.size, 8);
    assert!(fx.overlay.cache().get("/nope").flatten().is_some());

    let uncached = setup_with(|config| config.caching = false)?;
    assert!(uncached.overlay.get("/nope")?.is_none());
    assert!(uncached.overlay.cache().is_empty());
    Ok(())
}

#[test]
fn test_slow_lookup_does_not_cache_older_document() -> Result<()> {
    let (fx, store) = setup_interposed()?;
    write_file(&fx, "/f", b"x")?;
    fx.overlay.cache().clear();
    store.stall_lookup.store(true, Ordering::SeqCst);

    let reader = {
        let overlay = fx.overlay.clone();
        thread::spawn(move || overlay.stat("/f"))
    };
    thread::sleep(Duration::from_millis(50));
    let written = fx.overlay.chmod("/f", 0o600)?;
    let read = reader.join().expect("reader thread")?;
    assert!(read.rev <= written.rev);

    let cached = fx.overlay.stat("/f")?;
    assert_eq!(cached.rev, written.rev);
    assert_eq!(cached.stats.mode & 0o7777, 0o600);
    // a stale cached revision would make this a conflict
    assert_eq!(fx.overlay.chmod("/f", 0o640)?.stats.mode & 0o7777, 0o640);
    Ok(())
}

#[test]
fn test_concurrent_updates_on_shared_overlay() -> Result<()> {
    let fx = setup()?;
    for i in 0..4 {
        write_file(&fx, &format!("/f{}", i), b"x")?;
    }
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let overlay = fx.overlay.clone();
            thread::spawn(move || -> docfs_core::Result<()> {
                let own = format!("/f{}", i);
                for round in 0..10u32 {
                    overlay.chmod(&own, 0o600 | (round % 8))?;
                    overlay.listdir("/")?;
                    overlay.stat(&format!("/f{}", (i + 1) % 4))?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread")?;
    }
    for i in 0..4 {
        let path = format!("/f{}", i);
        let doc = fx.overlay.stat(&path)?;
        assert_eq!(doc.stats.mode & 0o7777, 0o601);
        assert_eq!(fx.overlay.views().path(&path)?.map(|d| d.rev), Some(doc.rev));
    }
    Ok(())
}

#[test]
fn test_rename_reports_partial_write() -> Result<()> {
    let (fx, store) = setup_interposed()?;
    fx.overlay.makedirs(&fx.alice, "/a/b", 0o755)?;
    write_file(&fx, "/a/b/f.txt", b"content")?;
    let dir = fx.overlay.stat("/a")?;
    let file = fx.overlay.stat("/a/b/f.txt")?;
    *store.race_batch.lock() = Some(file.id.clone());

    match fx.overlay.rename("/a", "/c", false) {
        Err(Error::PartialWrite { committed, failed, .. }) => {
            assert_eq!(committed.first(), Some(&dir.id));
            assert!(failed.contains(&file.id));
        }
        other => panic!("expected a partial write, got {:?}", other.map(|docs| docs.len())),
    }
    assert!(fx.mount.path().join("c/b/f.txt").exists());
    // the committed part is visible and nothing stale is served for the old path
    assert_eq!(fx.overlay.stat("/c")?.id, dir.id);
    assert!(fx.overlay.get("/a")?.is_none());
    Ok(())
}

#[test]
fn test_failed_overwrite_keeps_target() -> Result<()> {
    let fx = setup()?;
    fx.overlay.mkdir(&fx.alice, "/dir", 0o755)?;
    write_file(&fx, "/y.txt", b"yy")?;

    assert!(fx.overlay.rename("/dir", "/y.txt", true).is_err());
    assert_eq!(fx.overlay.stat("/y.txt")?.stats.size, 2);
    assert!(fx.mount.path().join("y.txt").is_file());
    assert!(fx.overlay.stat("/dir")?.is_dir());

    assert!(matches!(
        fx.overlay.rename("/y.txt", "/missing/y.txt", true),
        Err(Error::NotFound(_))
    ));
    assert!(fx.overlay.exists("/y.txt")?);
    Ok(())
}

#[test]
fn test_copy_host_file() -> Result<()> {
    let fx = setup()?;
    let host = TempDir::new()?;
    let src = host.path().join("report.txt");
    std::fs::write(&src, "quarterly numbers")?;
    std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o640))?;
    fx.overlay.mkdir(&fx.alice, "/in", 0o755)?;

    let written = fx.overlay.copy(&fx.alice, &src, "/in/report.txt")?;
    assert_eq!(written.len(), 2);
    let doc = fx.overlay.stat("/in/report.txt")?;
    assert_eq!(doc.stats.size, 17);
    assert_eq!(doc.stats.uid, 1000);
    assert_eq!(doc.mime_type, "text/plain");
    assert_eq!(std::fs::read_to_string(fx.mount.path().join("in/report.txt"))?, "quarterly numbers");

    // copying again over the same entry refreshes its document
    std::fs::write(&src, "revised")?;
    let rewritten = fx.overlay.copy(&fx.alice, &src, "/in/report.txt")?;
    assert_eq!(rewritten.len(), 1);
    assert_eq!(fx.overlay.stat("/in/report.txt")?.stats.size, 7);

    assert!(matches!(
        fx.overlay.copy(&fx.alice, &host.path().join("absent"), "/in/x"),
        Err(Error::NotFound(_))
    ));
    Ok(())
}
