//! Schemaless document storage.
//!
//! Documents are JSON objects identified by `_id` and versioned by a numeric `_rev`.
//! Every document carries a `doctype` discriminator so typed helpers can share a store.
//! Queries go through named views registered with [`DocumentStore::sync_views`].

pub mod local;
pub mod views;

pub use local::LocalStore;
pub use views::{KeyPart, MapFn, Query, Reduce, ReduceRow, ViewDef, ViewKey, ViewRow};

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::sync::Arc;

pub const DOCTYPE_FIELD: &str = "doctype";

/// A stored document: identity, revision and the remaining fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_rev", default)]
    pub rev: u64,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Record {
    pub fn doctype(&self) -> Option<&str> {
        self.body.get(DOCTYPE_FIELD).and_then(Value::as_str)
    }
}

/// One entry of the change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub id: String,
    pub rev: u64,
    pub deleted: bool,
    pub doctype: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ReplicateOptions {
    /// Only copy documents of this doctype.
    pub doctype: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    pub written: usize,
    pub skipped: usize,
}

/// Client capability set of a document store.
pub trait DocumentStore: Send + Sync {
    /// Store a new document. An empty id is replaced by a fresh one.
    fn create(&self, record: Record) -> Result<Record>;

    fn get(&self, id: &str) -> Result<Option<Record>>;

    /// Write every record in order, each checked against its stored revision.
    ///
    /// A failure after some records committed is reported as [`Error::PartialWrite`].
    fn update(&self, records: Vec<Record>) -> Result<Vec<Record>>;

    fn delete(&self, record: &Record) -> Result<()>;

    fn query(&self, view: &str, query: &Query) -> Result<Vec<ViewRow>>;

    /// Apply the view's reduction, grouping keys truncated to `group_level` parts.
    fn reduce(&self, view: &str, query: &Query, group_level: Option<usize>) -> Result<Vec<ReduceRow>>;

    fn changes(&self, since: u64, doctype: Option<&str>) -> Result<Vec<ChangeEvent>>;

    /// Store a record as-is when it is newer than the local copy. Returns whether it was written.
    fn import(&self, record: Record) -> Result<bool>;

    fn replicate(&self, target: &dyn DocumentStore, options: &ReplicateOptions) -> Result<ReplicationReport>;

    /// Register view definitions, rebuilding indexes whose name or version is new.
    fn sync_views(&self, views: &[ViewDef]) -> Result<()>;
}

/// A document type stored under its own doctype.
pub trait Doctype: Serialize + DeserializeOwned + Clone {
    const DOCTYPE: &'static str;

    fn id(&self) -> &str;
    fn rev(&self) -> u64;
    fn set_rev(&mut self, rev: u64);

    fn to_record(&self) -> Result<Record> {
        let mut record: Record = serde_json::from_value(serde_json::to_value(self)?)?;
        record
            .body
            .insert(DOCTYPE_FIELD.to_string(), Value::String(Self::DOCTYPE.to_string()));
        Ok(record)
    }

    fn from_record(record: &Record) -> Result<Self> {
        if record.doctype() != Some(Self::DOCTYPE) {
            return Err(Error::Store(format!(
                "document {} is not a {}",
                record.id,
                Self::DOCTYPE
            )));
        }
        Ok(serde_json::from_value(serde_json::to_value(record)?)?)
    }
}

/// Typed access to the documents of one doctype.
pub struct DocHelper<T> {
    store: Arc<dyn DocumentStore>,
    _doc: PhantomData<fn() -> T>,
}

impl<T> Clone for DocHelper<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _doc: PhantomData,
        }
    }
}

impl<T: Doctype> DocHelper<T> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            _doc: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn create(&self, doc: &T) -> Result<T> {
        let record = self.store.create(doc.to_record()?)?;
        T::from_record(&record)
    }

    pub fn get(&self, id: &str) -> Result<Option<T>> {
        match self.store.get(id)? {
            Some(record) if record.doctype() == Some(T::DOCTYPE) => Ok(Some(T::from_record(&record)?)),
            _ => Ok(None),
        }
    }

    pub fn update(&self, doc: &T) -> Result<T> {
        let mut docs = self.update_many(vec![doc.clone()])?;
        docs.pop()
            .ok_or_else(|| Error::Store(format!("update of {} returned nothing", doc.id())))
    }

    pub fn update_many(&self, docs: Vec<T>) -> Result<Vec<T>> {
        let records = docs.iter().map(Doctype::to_record).collect::<Result<Vec<_>>>()?;
        self.store
            .update(records)?
            .iter()
            .map(T::from_record)
            .collect()
    }

    pub fn delete(&self, doc: &T) -> Result<()> {
        self.store.delete(&doc.to_record()?)
    }

    /// Documents emitted by `view` for `query`, skipping other doctypes.
    pub fn query(&self, view: &str, query: &Query) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for row in self.store.query(view, query)? {
            if row.doc.doctype() == Some(T::DOCTYPE) && seen.insert(row.doc.id.clone()) {
                out.push(T::from_record(&row.doc)?);
            }
        }
        Ok(out)
    }
}
