//! Named indexes over the documents of a store.
//!
//! Every view is registered once per store through [`ViewRegistry`] and resolved into a
//! typed [`View`] handle when a helper is built, so a missing view fails at construction
//! rather than at query time.

use crate::document::SyncDocument;
use crate::error::{Error, Result};
use crate::path;
use crate::sharing::FriendDocument;
use crate::storage::{
    DocHelper, Doctype, DocumentStore, KeyPart, MapFn, Query, Reduce, ReduceRow, Record, ViewDef,
    ViewKey,
};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

pub const BY_PATH: &str = "by_path";
pub const BY_DIR: &str = "by_dir";
pub const BY_DIR_PREFIX: &str = "by_dir_prefix";
pub const BY_TAG: &str = "by_tag";
pub const BY_TYPE: &str = "by_type";
pub const BY_KEYWORD: &str = "by_keyword";
pub const BY_UID: &str = "by_uid";
pub const BY_PROVIDER_AND_PARTICIPANT: &str = "by_provider_and_participant";
pub const FRIEND_BY_LOGIN: &str = "friend_by_login";
pub const FRIEND_BY_STATUS: &str = "friend_by_status";

fn sync_doc(record: &Record) -> Option<SyncDocument> {
    if record.doctype() != Some(SyncDocument::DOCTYPE) {
        return None;
    }
    SyncDocument::from_record(record).ok()
}

fn friend_doc(record: &Record) -> Option<FriendDocument> {
    if record.doctype() != Some(FriendDocument::DOCTYPE) {
        return None;
    }
    FriendDocument::from_record(record).ok()
}

fn map_by_path(record: &Record) -> Vec<(ViewKey, i64)> {
    sync_doc(record)
        .map(|doc| vec![(vec![KeyPart::from(doc.path())], 1)])
        .unwrap_or_default()
}

fn map_by_dir(record: &Record) -> Vec<(ViewKey, i64)> {
    sync_doc(record)
        .map(|doc| vec![(vec![KeyPart::from(doc.dirpath)], 1)])
        .unwrap_or_default()
}

/// Emits the document's directory and each of its ancestors, valued by the entry size.
fn map_by_dir_prefix(record: &Record) -> Vec<(ViewKey, i64)> {
    let Some(doc) = sync_doc(record) else {
        return Vec::new();
    };
    let size = doc.stats.size as i64;
    let mut out = vec![(vec![KeyPart::from(doc.dirpath.as_str())], size)];
    for ancestor in path::ancestors(&doc.dirpath) {
        out.push((vec![KeyPart::from(ancestor)], size));
    }
    out
}

fn map_by_tag(record: &Record) -> Vec<(ViewKey, i64)> {
    let Some(doc) = sync_doc(record) else {
        return Vec::new();
    };
    doc.tags
        .iter()
        .map(|tag| (vec![KeyPart::from(tag.as_str()), KeyPart::from(doc.stats.uid)], 1))
        .collect()
}

fn map_by_type(record: &Record) -> Vec<(ViewKey, i64)> {
    match sync_doc(record) {
        Some(doc) if !doc.is_dir() => {
            let (category, subtype) = doc.mime_parts();
            vec![(vec![KeyPart::from(category), KeyPart::from(subtype)], 1)]
        }
        _ => Vec::new(),
    }
}

/// Lowercased suffixes of the filename, so any trailing fragment finds the entry.
fn map_by_keyword(record: &Record) -> Vec<(ViewKey, i64)> {
    let Some(doc) = sync_doc(record) else {
        return Vec::new();
    };
    let lower = doc.filename.to_lowercase();
    lower
        .char_indices()
        .map(|(i, _)| (vec![KeyPart::from(&lower[i..])], 1))
        .collect()
}

fn map_by_uid(record: &Record) -> Vec<(ViewKey, i64)> {
    sync_doc(record)
        .map(|doc| vec![(vec![KeyPart::from(doc.stats.uid), KeyPart::from(doc.path())], 1)])
        .unwrap_or_default()
}

fn map_by_provider_and_participant(record: &Record) -> Vec<(ViewKey, i64)> {
    let Some(doc) = sync_doc(record) else {
        return Vec::new();
    };
    let entry_path = doc.path();
    doc.acl
        .iter()
        .map(|grant| {
            (
                vec![
                    KeyPart::from(doc.stats.uid),
                    KeyPart::from(grant.qualifier),
                    KeyPart::from(entry_path.as_str()),
                ],
                1,
            )
        })
        .collect()
}

fn map_friend_by_login(record: &Record) -> Vec<(ViewKey, i64)> {
    friend_doc(record)
        .map(|doc| vec![(vec![KeyPart::from(doc.login)], 1)])
        .unwrap_or_default()
}

fn map_friend_by_status(record: &Record) -> Vec<(ViewKey, i64)> {
    friend_doc(record)
        .map(|doc| vec![(vec![KeyPart::from(doc.status.as_str())], 1)])
        .unwrap_or_default()
}

/// The view definitions known to a store.
#[derive(Clone, Debug)]
pub struct ViewRegistry {
    defs: BTreeMap<&'static str, ViewDef>,
}

impl ViewRegistry {
    pub fn empty() -> Self {
        Self {
            defs: BTreeMap::new(),
        }
    }

    /// Every view the overlay and the sharing resolver query.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        let defs: [(&'static str, MapFn, Option<Reduce>); 10] = [
            (BY_PATH, map_by_path, None),
            (BY_DIR, map_by_dir, None),
            (BY_DIR_PREFIX, map_by_dir_prefix, Some(Reduce::Sum)),
            (BY_TAG, map_by_tag, Some(Reduce::Count)),
            (BY_TYPE, map_by_type, Some(Reduce::Count)),
            (BY_KEYWORD, map_by_keyword, None),
            (BY_UID, map_by_uid, None),
            (BY_PROVIDER_AND_PARTICIPANT, map_by_provider_and_participant, Some(Reduce::Count)),
            (FRIEND_BY_LOGIN, map_friend_by_login, Some(Reduce::Count)),
            (FRIEND_BY_STATUS, map_friend_by_status, Some(Reduce::Count)),
        ];
        for (name, map, reduce) in defs {
            registry.register(ViewDef {
                name,
                version: 1,
                map,
                reduce,
            });
        }
        registry
    }

    pub fn register(&mut self, def: ViewDef) {
        self.defs.insert(def.name, def);
    }

    pub fn defs(&self) -> Vec<ViewDef> {
        self.defs.values().copied().collect()
    }

    /// Register every definition with `store`.
    pub fn sync(&self, store: &dyn DocumentStore) -> Result<()> {
        store.sync_views(&self.defs())
    }

    /// A typed handle on a registered view.
    pub fn resolve<T: Doctype>(&self, store: &Arc<dyn DocumentStore>, name: &'static str) -> Result<View<T>> {
        if !self.defs.contains_key(name) {
            return Err(Error::Store(format!("view {} is not registered", name)));
        }
        Ok(View {
            name,
            helper: DocHelper::new(store.clone()),
            _doc: PhantomData,
        })
    }
}

/// Typed queries against one view.
pub struct View<T> {
    name: &'static str,
    helper: DocHelper<T>,
    _doc: PhantomData<fn() -> T>,
}

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            helper: self.helper.clone(),
            _doc: PhantomData,
        }
    }
}

impl<T: Doctype> View<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, key: ViewKey) -> Result<Vec<T>> {
        self.helper.query(self.name, &Query::Key(key))
    }

    pub fn first(&self, key: ViewKey) -> Result<Option<T>> {
        Ok(self.get(key)?.into_iter().next())
    }

    pub fn prefix(&self, key: ViewKey) -> Result<Vec<T>> {
        self.helper.query(self.name, &Query::Prefix(key))
    }

    pub fn range(&self, start: ViewKey, end: ViewKey) -> Result<Vec<T>> {
        self.helper.query(self.name, &Query::Range { start, end })
    }

    pub fn all(&self) -> Result<Vec<T>> {
        self.helper.query(self.name, &Query::All)
    }

    pub fn reduce(&self, query: &Query, group_level: Option<usize>) -> Result<Vec<ReduceRow>> {
        self.helper.store().reduce(self.name, query, group_level)
    }
}

/// Views over filesystem documents.
#[derive(Clone)]
pub struct SyncViews {
    pub by_path: View<SyncDocument>,
    pub by_dir: View<SyncDocument>,
    pub by_dir_prefix: View<SyncDocument>,
    pub by_tag: View<SyncDocument>,
    pub by_type: View<SyncDocument>,
    pub by_keyword: View<SyncDocument>,
    pub by_uid: View<SyncDocument>,
    pub by_provider_and_participant: View<SyncDocument>,
}

impl SyncViews {
    pub fn new(store: Arc<dyn DocumentStore>, registry: &ViewRegistry) -> Result<Self> {
        registry.sync(store.as_ref())?;
        Ok(Self {
            by_path: registry.resolve(&store, BY_PATH)?,
            by_dir: registry.resolve(&store, BY_DIR)?,
            by_dir_prefix: registry.resolve(&store, BY_DIR_PREFIX)?,
            by_tag: registry.resolve(&store, BY_TAG)?,
            by_type: registry.resolve(&store, BY_TYPE)?,
            by_keyword: registry.resolve(&store, BY_KEYWORD)?,
            by_uid: registry.resolve(&store, BY_UID)?,
            by_provider_and_participant: registry.resolve(&store, BY_PROVIDER_AND_PARTICIPANT)?,
        })
    }

    pub fn path(&self, entry_path: &str) -> Result<Option<SyncDocument>> {
        self.by_path.first(vec![entry_path.into()])
    }

    pub fn children(&self, dir: &str) -> Result<Vec<SyncDocument>> {
        self.by_dir.get(vec![dir.into()])
    }

    /// Every document below `dir`, at any depth.
    pub fn descendants(&self, dir: &str) -> Result<Vec<SyncDocument>> {
        self.by_dir_prefix.get(vec![dir.into()])
    }

    /// Total size of the entries below `dir`.
    pub fn size_under(&self, dir: &str) -> Result<u64> {
        let rows = self.by_dir_prefix.reduce(&Query::Key(vec![dir.into()]), None)?;
        Ok(rows.first().map(|row| row.value.max(0) as u64).unwrap_or(0))
    }

    pub fn tagged(&self, tag: &str) -> Result<Vec<SyncDocument>> {
        self.by_tag.prefix(vec![tag.into()])
    }

    /// Tags in use with their entry counts, optionally restricted to one owner.
    pub fn tags(&self, uid: Option<u32>) -> Result<Vec<(String, i64)>> {
        let rows = self.by_tag.reduce(&Query::All, Some(2))?;
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for row in rows {
            let (Some(tag), owner) = (row.key.first().and_then(KeyPart::as_str), row.key.get(1)) else {
                continue;
            };
            if uid.is_some_and(|uid| owner.and_then(KeyPart::as_int) != Some(uid as i64)) {
                continue;
            }
            *counts.entry(tag.to_string()).or_insert(0) += row.value;
        }
        Ok(counts.into_iter().collect())
    }

    /// Mime categories, or the subtypes of one category, with their entry counts.
    pub fn type_groups(&self, category: Option<&str>) -> Result<Vec<(String, i64)>> {
        let (query, level) = match category {
            Some(category) => (Query::Prefix(vec![category.into()]), 2),
            None => (Query::All, 1),
        };
        Ok(self
            .by_type
            .reduce(&query, Some(level))?
            .into_iter()
            .filter_map(|row| {
                row.key
                    .get(level - 1)
                    .and_then(KeyPart::as_str)
                    .map(|name| (name.to_string(), row.value))
            })
            .collect())
    }

    pub fn of_type(&self, category: &str, subtype: &str) -> Result<Vec<SyncDocument>> {
        self.by_type.get(vec![category.into(), subtype.into()])
    }

    pub fn search(&self, keyword: &str) -> Result<Vec<SyncDocument>> {
        self.by_keyword.get(vec![keyword.to_lowercase().into()])
    }

    /// Entries owned by `owner` that carry a grant for `participant`.
    pub fn shared_with(&self, owner: u32, participant: u32) -> Result<Vec<SyncDocument>> {
        self.by_provider_and_participant
            .prefix(vec![owner.into(), participant.into()])
    }

    /// Participants of `owner`'s grants with the number of entries shared with each.
    pub fn participants(&self, owner: u32) -> Result<Vec<(u32, i64)>> {
        let rows = self
            .by_provider_and_participant
            .reduce(&Query::Prefix(vec![owner.into()]), Some(2))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let participant = row.key.get(1)?.as_int()?;
                u32::try_from(participant).ok().map(|uid| (uid, row.value))
            })
            .collect())
    }

    pub fn owned_by(&self, uid: u32) -> Result<Vec<SyncDocument>> {
        self.by_uid.prefix(vec![uid.into()])
    }
}

/// Views over relationship documents.
#[derive(Clone)]
pub struct FriendViews {
    pub by_login: View<FriendDocument>,
    pub by_status: View<FriendDocument>,
}

impl FriendViews {
    pub fn new(store: Arc<dyn DocumentStore>, registry: &ViewRegistry) -> Result<Self> {
        registry.sync(store.as_ref())?;
        Ok(Self {
            by_login: registry.resolve(&store, FRIEND_BY_LOGIN)?,
            by_status: registry.resolve(&store, FRIEND_BY_STATUS)?,
        })
    }
}
