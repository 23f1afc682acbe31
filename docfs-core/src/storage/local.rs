//! Directory-backed document store.
//! Documents are stored individually on disk as JSON and loaded at startup.

use super::views::ViewIndex;
use super::{
    ChangeEvent, DocumentStore, Query, Record, ReduceRow, ReplicateOptions, ReplicationReport,
    ViewDef, ViewRow,
};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

struct Inner {
    docs: HashMap<String, Record>,
    seq: u64,
    /// Latest change per document, keyed by sequence number.
    changes: BTreeMap<u64, ChangeEvent>,
    last_seq: HashMap<String, u64>,
    views: HashMap<&'static str, ViewIndex>,
}

impl Inner {
    fn record_change(&mut self, record: &Record, deleted: bool) {
        self.seq += 1;
        if let Some(previous) = self.last_seq.insert(record.id.clone(), self.seq) {
            self.changes.remove(&previous);
        }
        self.changes.insert(
            self.seq,
            ChangeEvent {
                seq: self.seq,
                id: record.id.clone(),
                rev: record.rev,
                deleted,
                doctype: record.doctype().map(str::to_string),
            },
        );
    }

    fn index(&mut self, record: &Record) {
        for view in self.views.values_mut() {
            view.insert(record);
        }
    }

    fn unindex(&mut self, id: &str) {
        for view in self.views.values_mut() {
            view.remove(id);
        }
    }

    fn view(&self, name: &str) -> Result<&ViewIndex> {
        self.views
            .get(name)
            .ok_or_else(|| Error::Store(format!("view {} is not registered", name)))
    }
}

pub struct LocalStore {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

impl LocalStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io("create store", &dir, e))?;
        let mut inner = Inner {
            docs: HashMap::new(),
            seq: 0,
            changes: BTreeMap::new(),
            last_seq: HashMap::new(),
            views: HashMap::new(),
        };
        let entries = std::fs::read_dir(&dir).map_err(|e| Error::io("read store", &dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("read store", &dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let loaded = std::fs::read(&path)
                .map_err(|e| Error::io("load document", &path, e))
                .and_then(|data| Ok(serde_json::from_slice::<Record>(&data)?));
            match loaded {
                Ok(record) => {
                    inner.record_change(&record, false);
                    inner.docs.insert(record.id.clone(), record);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable document"),
            }
        }
        debug!(dir = %dir.display(), docs = inner.docs.len(), "opened document store");
        Ok(Self {
            dir,
            inner: RwLock::new(inner),
        })
    }

    /// Directory where documents are persisted.
    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.inner.read().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn save(&self, record: &Record) -> Result<()> {
        let path = self.path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec(record)?;
        std::fs::write(&tmp, data).map_err(|e| Error::io("write document", &tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::io("write document", &path, e))
    }

    fn remove_file(&self, id: &str) -> Result<()> {
        let path = self.path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("delete document", &path, e)),
        }
    }

    fn write_one(&self, inner: &mut Inner, mut record: Record) -> Result<Record> {
        let stored = inner
            .docs
            .get(&record.id)
            .ok_or_else(|| Error::NotFound(record.id.clone()))?;
        if stored.rev != record.rev {
            return Err(Error::Conflict {
                id: record.id.clone(),
                expected: record.rev,
                found: stored.rev,
            });
        }
        record.rev += 1;
        self.save(&record)?;
        inner.index(&record);
        inner.record_change(&record, false);
        inner.docs.insert(record.id.clone(), record.clone());
        Ok(record)
    }
}

impl DocumentStore for LocalStore {
    fn create(&self, mut record: Record) -> Result<Record> {
        let mut inner = self.inner.write();
        if record.id.is_empty() {
            record.id = Uuid::new_v4().simple().to_string();
        }
        if let Some(existing) = inner.docs.get(&record.id) {
            return Err(Error::Conflict {
                id: record.id.clone(),
                expected: 0,
                found: existing.rev,
            });
        }
        record.rev = 1;
        self.save(&record)?;
        inner.index(&record);
        inner.record_change(&record, false);
        inner.docs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn get(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.inner.read().docs.get(id).cloned())
    }

    fn update(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut inner = self.inner.write();
        let mut written = Vec::with_capacity(records.len());
        let mut pending = records.into_iter();
        while let Some(record) = pending.next() {
            let id = record.id.clone();
            match self.write_one(&mut inner, record) {
                Ok(record) => written.push(record),
                Err(source) if written.is_empty() => return Err(source),
                Err(source) => {
                    let mut failed = vec![id];
                    failed.extend(pending.map(|r| r.id));
                    return Err(Error::PartialWrite {
                        committed: written.into_iter().map(|r| r.id).collect(),
                        failed,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(written)
    }

    fn delete(&self, record: &Record) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .docs
            .get(&record.id)
            .ok_or_else(|| Error::NotFound(record.id.clone()))?;
        if stored.rev != record.rev {
            return Err(Error::Conflict {
                id: record.id.clone(),
                expected: record.rev,
                found: stored.rev,
            });
        }
        self.remove_file(&record.id)?;
        if let Some(mut removed) = inner.docs.remove(&record.id) {
            removed.rev += 1;
            inner.unindex(&removed.id);
            inner.record_change(&removed, true);
        }
        Ok(())
    }

    fn query(&self, view: &str, query: &Query) -> Result<Vec<ViewRow>> {
        let inner = self.inner.read();
        let rows = inner.view(view)?.scan(query);
        Ok(rows
            .into_iter()
            .filter_map(|(key, id, value)| {
                inner.docs.get(&id).map(|doc| ViewRow {
                    key,
                    value,
                    doc: doc.clone(),
                })
            })
            .collect())
    }

    fn reduce(&self, view: &str, query: &Query, group_level: Option<usize>) -> Result<Vec<ReduceRow>> {
        let inner = self.inner.read();
        Ok(inner.view(view)?.reduce(query, group_level))
    }

    fn changes(&self, since: u64, doctype: Option<&str>) -> Result<Vec<ChangeEvent>> {
        let inner = self.inner.read();
        Ok(inner
            .changes
            .range(since + 1..)
            .map(|(_, change)| change)
            .filter(|change| doctype.map_or(true, |d| change.doctype.as_deref() == Some(d)))
            .cloned()
            .collect())
    }

    fn import(&self, record: Record) -> Result<bool> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.docs.get(&record.id) {
            if existing.rev >= record.rev {
                return Ok(false);
            }
        }
        self.save(&record)?;
        inner.index(&record);
        inner.record_change(&record, false);
        inner.docs.insert(record.id.clone(), record);
        Ok(true)
    }

    fn replicate(&self, target: &dyn DocumentStore, options: &ReplicateOptions) -> Result<ReplicationReport> {
        let records: Vec<Record> = {
            let inner = self.inner.read();
            inner
                .docs
                .values()
                .filter(|r| {
                    options
                        .doctype
                        .as_deref()
                        .map_or(true, |d| r.doctype() == Some(d))
                })
                .cloned()
                .collect()
        };
        let mut report = ReplicationReport::default();
        for record in records {
            if target.import(record)? {
                report.written += 1;
            } else {
                report.skipped += 1;
            }
        }
        debug!(written = report.written, skipped = report.skipped, "replicated store");
        Ok(report)
    }

    fn sync_views(&self, views: &[ViewDef]) -> Result<()> {
        let mut inner = self.inner.write();
        for def in views {
            let current = inner.views.get(def.name).map(|v| v.def.version);
            if current == Some(def.version) {
                continue;
            }
            let mut index = ViewIndex::new(*def);
            for record in inner.docs.values() {
                index.insert(record);
            }
            debug!(view = def.name, version = def.version, "built view index");
            inner.views.insert(def.name, index);
        }
        Ok(())
    }
}
