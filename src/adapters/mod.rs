pub mod memory;
pub mod record;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
pub use memory::MemoryAdapter;
pub use record::*;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    Object,
    edge::{LedgerEntry, LedgerKind},
    error::Error,
    query::Query,
};

/// Address of one document in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "doc", rename_all = "lowercase")]
pub enum DocKey {
    Object {
        type_name: String,
        id: String,
    },
    Edge {
        type_name: String,
        from: String,
        to: String,
    },
}

impl DocKey {
    pub fn object<T: Object>(id: &str) -> Self {
        DocKey::Object {
            type_name: T::TYPE.to_string(),
            id: id.to_string(),
        }
    }

    pub fn edge(kind: LedgerKind, from: &str, to: &str) -> Self {
        DocKey::Edge {
            type_name: kind.type_name().to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            DocKey::Object { type_name, .. } | DocKey::Edge { type_name, .. } => type_name,
        }
    }
}

/// Versioned point reads of a key set. A key that was read but does not
/// exist maps to `None` and counts as version 0.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    docs: BTreeMap<DocKey, Option<Record>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: DocKey, record: Option<Record>) {
        self.docs.insert(key, record);
    }

    pub fn contains(&self, key: &DocKey) -> bool {
        self.docs.contains_key(key)
    }

    pub fn get(&self, key: &DocKey) -> Option<&Record> {
        self.docs.get(key).and_then(|r| r.as_ref())
    }

    /// Version seen for `key`, `None` if the key was never read.
    pub fn version(&self, key: &DocKey) -> Option<i64> {
        self.docs
            .get(key)
            .map(|r| r.as_ref().map(Record::version).unwrap_or(0))
    }

    pub fn object<T: Object>(&self, id: &str) -> Result<Option<T>, Error> {
        match self.get(&DocKey::object::<T>(id)) {
            Some(Record::Object(r)) => r.clone().to_object().map(Some),
            Some(Record::Edge(_)) => Err(Error::TypeMismatch),
            None => Ok(None),
        }
    }

    pub fn entry(&self, kind: LedgerKind, from: &str, to: &str) -> Result<Option<LedgerEntry>, Error> {
        match self.get(&DocKey::edge(kind, from, to)) {
            Some(Record::Edge(r)) => r.clone().to_entry().map(Some),
            Some(Record::Object(_)) => Err(Error::TypeMismatch),
            None => Ok(None),
        }
    }

    /// `(key, version)` for every read document; the commit precondition.
    pub fn expectations(&self) -> Vec<(DocKey, i64)> {
        self.docs
            .iter()
            .map(|(k, r)| (k.clone(), r.as_ref().map(Record::version).unwrap_or(0)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Put(Record),
    Delete(DocKey),
}

impl Write {
    pub fn key(&self) -> DocKey {
        match self {
            Write::Put(r) => r.key(),
            Write::Delete(k) => k.clone(),
        }
    }
}

/// Checks that every write targets a document whose version was read, and
/// returns the expected versions by key.
pub(crate) fn expected_versions(
    expected: &[(DocKey, i64)],
    writes: &[Write],
) -> Result<HashMap<DocKey, i64>, Error> {
    let map: HashMap<DocKey, i64> = expected.iter().cloned().collect();
    for write in writes {
        let key = write.key();
        if !map.contains_key(&key) {
            return Err(Error::Storage(format!(
                "write to unread document {:?} would escape conflict detection",
                key
            )));
        }
    }
    Ok(map)
}

/// Broadcast of committed document keys.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<DocKey>,
}

impl ChangeFeed {
    pub const CAPACITY: usize = 1024;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    pub fn publish<I: IntoIterator<Item = DocKey>>(&self, keys: I) {
        for key in keys {
            // no subscribers is fine
            let _ = self.sender.send(key);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocKey> {
        self.sender.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// -----------------------------
/// Adapter contract
/// -----------------------------
///
/// The store offers versioned reads and a conditional multi-document commit.
/// `commit` must apply all writes or none, and must fail with
/// [`Error::Conflict`] when any expected version no longer matches.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    async fn read(&self, keys: &[DocKey]) -> Result<Snapshot, Error>;

    async fn commit(&self, expected: &[(DocKey, i64)], writes: Vec<Write>) -> Result<(), Error>;

    async fn fetch_object(
        &self,
        type_name: &'static str,
        id: &str,
    ) -> Result<Option<ObjectRecord>, Error>;

    async fn query_objects(
        &self,
        type_name: &'static str,
        query: Query,
    ) -> Result<Vec<ObjectRecord>, Error>;

    async fn fetch_edge(
        &self,
        type_name: &'static str,
        from: &str,
        to: &str,
    ) -> Result<Option<EdgeRecord>, Error>;

    /// Every edge of `type_name` leaving `from`.
    async fn query_edges(&self, type_name: &'static str, from: &str)
    -> Result<Vec<EdgeRecord>, Error>;

    /// Keys of documents as they are committed.
    fn subscribe(&self) -> broadcast::Receiver<DocKey>;
}
