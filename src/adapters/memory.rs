use std::collections::BTreeMap;
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicI64, Ordering},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    adapters::{
        Adapter, ChangeFeed, DocKey, EdgeRecord, ObjectRecord, Record, Snapshot, Write,
        expected_versions,
    },
    error::Error,
    query::Query,
};

/// Process-local store. Every commit runs under one lock, so it is trivially
/// serializable; conflicts still surface through version checks because reads
/// and commits are separate calls.
///
/// Versions come from one store-wide counter, so a document deleted and
/// created again never repeats a version an earlier read saw.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    docs: Arc<Mutex<BTreeMap<DocKey, Record>>>,
    stamp: Arc<AtomicI64>,
    feed: ChangeFeed,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn docs(&self) -> Result<MutexGuard<'_, BTreeMap<DocKey, Record>>, Error> {
        self.docs
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))
    }

    /// Number of stored documents, across all types.
    pub fn len(&self) -> usize {
        self.docs().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn read(&self, keys: &[DocKey]) -> Result<Snapshot, Error> {
        let docs = self.docs()?;
        let mut snapshot = Snapshot::new();
        for key in keys {
            snapshot.insert(key.clone(), docs.get(key).cloned());
        }
        Ok(snapshot)
    }

    async fn commit(&self, expected: &[(DocKey, i64)], writes: Vec<Write>) -> Result<(), Error> {
        expected_versions(expected, &writes)?;
        let mut changed = Vec::with_capacity(writes.len());
        {
            let mut docs = self.docs()?;

            for (key, version) in expected {
                let current = docs.get(key).map(Record::version).unwrap_or(0);
                if current != *version {
                    return Err(Error::Conflict);
                }
            }

            // taken under the docs lock, so stamps grow in commit order
            let stamp = self.stamp.fetch_add(1, Ordering::SeqCst) + 1;
            for write in writes {
                let key = write.key();
                match write {
                    Write::Put(mut record) => {
                        record.set_version(stamp);
                        docs.insert(key.clone(), record);
                    }
                    Write::Delete(_) => {
                        docs.remove(&key);
                    }
                }
                changed.push(key);
            }
        }

        self.feed.publish(changed);
        Ok(())
    }

    async fn fetch_object(
        &self,
        type_name: &'static str,
        id: &str,
    ) -> Result<Option<ObjectRecord>, Error> {
        let key = DocKey::Object {
            type_name: type_name.to_string(),
            id: id.to_string(),
        };
        match self.docs()?.get(&key) {
            Some(Record::Object(r)) => Ok(Some(r.clone())),
            Some(Record::Edge(_)) => Err(Error::TypeMismatch),
            None => Ok(None),
        }
    }

    async fn query_objects(
        &self,
        type_name: &'static str,
        query: Query,
    ) -> Result<Vec<ObjectRecord>, Error> {
        query.validate_fields()?;
        let mut records: Vec<ObjectRecord> = self
            .docs()?
            .values()
            .filter_map(|r| match r {
                Record::Object(o) if o.type_name == type_name && query.matches(&o.index_meta) => {
                    Some(o.clone())
                }
                _ => None,
            })
            .collect();

        records.sort_by(|a, b| {
            query
                .order(&a.index_meta, &b.index_meta)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = query.limit {
            records.truncate(limit as usize);
        }
        Ok(records)
    }

    async fn fetch_edge(
        &self,
        type_name: &'static str,
        from: &str,
        to: &str,
    ) -> Result<Option<EdgeRecord>, Error> {
        let key = DocKey::Edge {
            type_name: type_name.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        };
        match self.docs()?.get(&key) {
            Some(Record::Edge(r)) => Ok(Some(r.clone())),
            Some(Record::Object(_)) => Err(Error::TypeMismatch),
            None => Ok(None),
        }
    }

    async fn query_edges(
        &self,
        type_name: &'static str,
        from: &str,
    ) -> Result<Vec<EdgeRecord>, Error> {
        let mut edges: Vec<EdgeRecord> = self
            .docs()?
            .values()
            .filter_map(|r| match r {
                Record::Edge(e) if e.type_name == type_name && e.from == from => Some(e.clone()),
                _ => None,
            })
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.to.cmp(&b.to)));
        Ok(edges)
    }

    fn subscribe(&self) -> broadcast::Receiver<DocKey> {
        self.feed.subscribe()
    }
}
