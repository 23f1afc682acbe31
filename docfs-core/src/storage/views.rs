use super::Record;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One component of a composite view key. Integers sort before strings.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Int(i64),
    Str(String),
}

impl KeyPart {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyPart::Str(s) => Some(s),
            KeyPart::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            KeyPart::Int(i) => Some(*i),
            KeyPart::Str(_) => None,
        }
    }
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Str(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Str(s)
    }
}

impl From<u32> for KeyPart {
    fn from(i: u32) -> Self {
        KeyPart::Int(i as i64)
    }
}

impl From<i64> for KeyPart {
    fn from(i: i64) -> Self {
        KeyPart::Int(i)
    }
}

pub type ViewKey = Vec<KeyPart>;

/// Emits `(key, value)` pairs for a document. Values feed the reduction.
pub type MapFn = fn(&Record) -> Vec<(ViewKey, i64)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduce {
    Sum,
    Count,
}

/// A named, versioned index definition.
#[derive(Clone, Copy, Debug)]
pub struct ViewDef {
    pub name: &'static str,
    pub version: u32,
    pub map: MapFn,
    pub reduce: Option<Reduce>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Query {
    All,
    Key(ViewKey),
    /// Keys starting with the given parts.
    Prefix(ViewKey),
    /// `start` inclusive, `end` exclusive.
    Range { start: ViewKey, end: ViewKey },
}

impl Query {
    pub fn key<K: Into<KeyPart>>(key: K) -> Self {
        Query::Key(vec![key.into()])
    }

    fn lower(&self) -> Option<&ViewKey> {
        match self {
            Query::All => None,
            Query::Key(k) | Query::Prefix(k) => Some(k),
            Query::Range { start, .. } => Some(start),
        }
    }

    fn accepts(&self, key: &ViewKey) -> bool {
        match self {
            Query::All => true,
            Query::Key(k) => key == k,
            Query::Prefix(p) => key.starts_with(p),
            Query::Range { end, .. } => key < end,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ViewRow {
    pub key: ViewKey,
    pub value: i64,
    pub doc: Record,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReduceRow {
    pub key: ViewKey,
    pub value: i64,
}

/// Ordered index of one view, kept current on every write.
pub(crate) struct ViewIndex {
    pub(crate) def: ViewDef,
    rows: BTreeMap<(ViewKey, String), i64>,
    by_doc: HashMap<String, Vec<ViewKey>>,
}

impl ViewIndex {
    pub(crate) fn new(def: ViewDef) -> Self {
        Self {
            def,
            rows: BTreeMap::new(),
            by_doc: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, record: &Record) {
        self.remove(&record.id);
        let emitted = (self.def.map)(record);
        let mut keys = Vec::with_capacity(emitted.len());
        for (key, value) in emitted {
            self.rows.insert((key.clone(), record.id.clone()), value);
            keys.push(key);
        }
        if !keys.is_empty() {
            self.by_doc.insert(record.id.clone(), keys);
        }
    }

    pub(crate) fn remove(&mut self, id: &str) {
        if let Some(keys) = self.by_doc.remove(id) {
            for key in keys {
                self.rows.remove(&(key, id.to_string()));
            }
        }
    }

    /// Matching `(key, doc id, value)` triples in key order.
    pub(crate) fn scan(&self, query: &Query) -> Vec<(ViewKey, String, i64)> {
        let iter: Box<dyn Iterator<Item = (&(ViewKey, String), &i64)> + '_> = match query.lower() {
            Some(lower) => Box::new(self.rows.range((lower.clone(), String::new())..)),
            None => Box::new(self.rows.iter()),
        };
        iter.take_while(|((key, _), _)| query.accepts(key))
            .map(|((key, id), value)| (key.clone(), id.clone(), *value))
            .collect()
    }

    pub(crate) fn reduce(&self, query: &Query, group_level: Option<usize>) -> Vec<ReduceRow> {
        let reduce = self.def.reduce.unwrap_or(Reduce::Count);
        let mut groups: BTreeMap<ViewKey, i64> = BTreeMap::new();
        for (key, _, value) in self.scan(query) {
            let group = match group_level {
                Some(level) => key.into_iter().take(level).collect(),
                None => Vec::new(),
            };
            let acc = groups.entry(group).or_insert(0);
            match reduce {
                Reduce::Sum => *acc += value,
                Reduce::Count => *acc += 1,
            }
        }
        groups
            .into_iter()
            .map(|(key, value)| ReduceRow { key, value })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn record(id: &str, body: Value) -> Record {
        let body: Map<String, Value> = serde_json::from_value(body).unwrap();
        Record {
            id: id.to_string(),
            rev: 1,
            body,
        }
    }

    fn by_words(record: &Record) -> Vec<(ViewKey, i64)> {
        let size = record.body.get("size").and_then(Value::as_i64).unwrap_or(0);
        record
            .body
            .get("words")
            .and_then(Value::as_array)
            .map(|words| {
                words
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|w| (w.split('/').map(KeyPart::from).collect(), size))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn index() -> ViewIndex {
        let mut index = ViewIndex::new(ViewDef {
            name: "by_words",
            version: 1,
            map: by_words,
            reduce: Some(Reduce::Sum),
        });
        index.insert(&record("a", json!({"words": ["text/plain", "image/png"], "size": 5})));
        index.insert(&record("b", json!({"words": ["text/html"], "size": 7})));
        index.insert(&record("c", json!({"words": ["text/plain"], "size": 11})));
        index
    }

    #[test]
    fn key_prefix_and_range_scans() {
        let index = index();
        let plain = index.scan(&Query::Key(vec!["text".into(), "plain".into()]));
        let ids: Vec<&str> = plain.iter().map(|(_, id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        assert_eq!(index.scan(&Query::Prefix(vec!["text".into()])).len(), 3);
        let range = index.scan(&Query::Range {
            start: vec!["image".into()],
            end: vec!["text".into(), "p".into()],
        });
        assert_eq!(range.len(), 2);
        assert_eq!(index.scan(&Query::All).len(), 4);
    }

    #[test]
    fn reinsert_replaces_rows() {
        let mut index = index();
        index.insert(&record("a", json!({"words": ["audio/ogg"], "size": 1})));
        assert_eq!(index.scan(&Query::Prefix(vec!["image".into()])).len(), 0);
        index.remove("c");
        assert_eq!(index.scan(&Query::Prefix(vec!["text".into()])).len(), 1);
    }

    #[test]
    fn grouped_reduction() {
        let index = index();
        let total = index.reduce(&Query::All, None);
        assert_eq!(total, vec![ReduceRow { key: vec![], value: 28 }]);
        let groups = index.reduce(&Query::Prefix(vec!["text".into()]), Some(2));
        assert_eq!(
            groups,
            vec![
                ReduceRow { key: vec!["text".into(), "html".into()], value: 7 },
                ReduceRow { key: vec!["text".into(), "plain".into()], value: 16 },
            ]
        );
    }
}
