//! Short-lived per-path memo of metadata lookups.
//!
//! Entries expire after a fixed TTL regardless of use; the store stays the source of truth.
//!
//! A miss is filled while holding the fill gate, and writers hold the same gate from their
//! store write until the new entries are cached. A slow fill therefore never lands on top of
//! a newer document.

use crate::document::SyncDocument;
use crate::path;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Result of consulting the cache for one path.
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup {
    Fresh(SyncDocument),
    /// The store was asked recently and had nothing at this path.
    ConfirmedAbsent,
    /// Never cached or expired; ask the store.
    Stale,
}

struct Entry {
    doc: Option<SyncDocument>,
    stored_at: Instant,
}

pub struct MetadataCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    fill: Mutex<()>,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            fill: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn lookup(&self, key: &str) -> Lookup {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => {
                return match &entry.doc {
                    Some(doc) => Lookup::Fresh(doc.clone()),
                    None => Lookup::ConfirmedAbsent,
                };
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Lookup::Stale
    }

    /// The cached value when present and not expired. `Some(None)` is a confirmed absence.
    pub fn get(&self, key: &str) -> Option<Option<SyncDocument>> {
        match self.lookup(key) {
            Lookup::Fresh(doc) => Some(Some(doc)),
            Lookup::ConfirmedAbsent => Some(None),
            Lookup::Stale => None,
        }
    }

    pub fn is_stale(&self, key: &str) -> bool {
        matches!(self.lookup(key), Lookup::Stale)
    }

    /// Serializes store writes with the fills of [`get_or_fetch`](Self::get_or_fetch).
    ///
    /// Not reentrant: do not call `get_or_fetch` while holding it.
    pub fn gate(&self) -> MutexGuard<'_, ()> {
        self.fill.lock()
    }

    /// The cached value, or the answer of `fetch` cached under the fill gate.
    pub fn get_or_fetch<E>(
        &self,
        key: &str,
        fetch: impl FnOnce() -> Result<Option<SyncDocument>, E>,
    ) -> Result<Option<SyncDocument>, E> {
        if let Some(cached) = self.get(key) {
            return Ok(cached);
        }
        let _gate = self.fill.lock();
        // a writer may have cached this path while we waited
        if let Some(cached) = self.get(key) {
            return Ok(cached);
        }
        let doc = fetch()?;
        self.put(key, doc.clone());
        Ok(doc)
    }

    pub fn put(&self, key: &str, doc: Option<SyncDocument>) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                doc,
                stored_at: Instant::now(),
            },
        );
    }

    /// Cache each document under its own path.
    pub fn prime(&self, docs: &[SyncDocument]) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        for doc in docs {
            entries.insert(
                doc.path(),
                Entry {
                    doc: Some(doc.clone()),
                    stored_at: now,
                },
            );
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Drop `dir` and every cached path beneath it.
    pub fn invalidate_prefix(&self, dir: &str) {
        self.entries.lock().retain(|key, _| !path::is_under(key, dir));
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Stats, S_IFREG};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn doc(entry_path: &str) -> SyncDocument {
        let stats = Stats {
            mode: S_IFREG | 0o644,
            ..Stats::default()
        };
        SyncDocument::new(entry_path, "text/plain", stats)
    }

    #[test]
    fn three_state_lookup() {
        let cache = MetadataCache::default();
        assert_eq!(cache.lookup("/a"), Lookup::Stale);
        cache.put("/a", None);
        assert_eq!(cache.lookup("/a"), Lookup::ConfirmedAbsent);
        assert_eq!(cache.get("/a"), Some(None));
        let a = doc("/a");
        cache.put("/a", Some(a.clone()));
        assert_eq!(cache.lookup("/a"), Lookup::Fresh(a));
        cache.invalidate("/a");
        assert!(cache.is_stale("/a"));
    }

    #[test]
    fn entries_expire() {
        let cache = MetadataCache::new(Duration::from_millis(20));
        cache.put("/a", Some(doc("/a")));
        assert!(!cache.is_stale("/a"));
        thread::sleep(Duration::from_millis(40));
        assert!(cache.is_stale("/a"));
        assert_eq!(cache.get("/a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn prefix_invalidation() {
        let cache = MetadataCache::default();
        cache.prime(&[doc("/a"), doc("/a/b"), doc("/a/b/c"), doc("/ab")]);
        assert_eq!(cache.len(), 4);
        cache.invalidate_prefix("/a");
        assert!(cache.is_stale("/a/b/c"));
        assert!(!cache.is_stale("/ab"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fetch_fills_once() {
        let cache = MetadataCache::default();
        let fetched = cache.get_or_fetch::<()>("/a", || Ok(Some(doc("/a")))).unwrap();
        assert_eq!(fetched.map(|d| d.path()), Some("/a".to_string()));
        let again = cache
            .get_or_fetch::<()>("/a", || panic!("served from the cache"))
            .unwrap();
        assert!(again.is_some());
        assert_eq!(cache.get_or_fetch::<&str>("/b", || Err("offline")), Err("offline"));
        assert!(cache.is_stale("/b"));
    }

    #[test]
    fn slow_fill_does_not_replace_newer_write() {
        let cache = Arc::new(MetadataCache::default());
        let fetching = Arc::new(AtomicBool::new(false));
        let mut old = doc("/a");
        old.rev = 1;
        let mut new = old.clone();
        new.rev = 2;

        let reader = {
            let cache = cache.clone();
            let fetching = fetching.clone();
            thread::spawn(move || {
                cache.get_or_fetch::<()>("/a", || {
                    fetching.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    Ok(Some(old))
                })
            })
        };
        while !fetching.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        {
            let _gate = cache.gate();
            cache.prime(std::slice::from_ref(&new));
        }
        let filled = reader.join().unwrap().unwrap().unwrap();
        assert_eq!(filled.rev, 1);
        assert_eq!(cache.get("/a").flatten().map(|d| d.rev), Some(2));
    }
}
