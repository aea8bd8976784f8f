use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    adapters::{Adapter, DocKey, EdgeRecord, Record, Write},
    edge::{LedgerEntry, LedgerKind},
    error::Error,
};

/// One ledger kind over the store: one entry per `(actor, target)`.
///
/// Plain collection access. The engine does not go through these methods for
/// its own writes; it reads and writes the same documents inside a
/// transaction.
#[derive(Clone)]
pub struct LedgerStore {
    adapter: Arc<dyn Adapter>,
    kind: LedgerKind,
}

impl LedgerStore {
    pub fn new(adapter: Arc<dyn Adapter>, kind: LedgerKind) -> Self {
        Self { adapter, kind }
    }

    pub fn kind(&self) -> LedgerKind {
        self.kind
    }

    pub async fn get(&self, actor_id: &str, target: &str) -> Result<Option<LedgerEntry>, Error> {
        match self
            .adapter
            .fetch_edge(self.kind.type_name(), actor_id, target)
            .await?
        {
            Some(record) => record.to_entry().map(Some),
            None => Ok(None),
        }
    }

    /// Insert or replace the entry for `(actor_id, target)`.
    pub async fn put(
        &self,
        actor_id: &str,
        target: &str,
        target_key: &str,
        counterpart_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, Error> {
        let key = DocKey::edge(self.kind, actor_id, target);
        let snapshot = self.adapter.read(std::slice::from_ref(&key)).await?;
        let entry = LedgerEntry::new(self.kind, actor_id, target, target_key, counterpart_id, now);
        let record = Record::Edge(EdgeRecord::from_entry(&entry)?);
        self.adapter
            .commit(&snapshot.expectations(), vec![Write::Put(record)])
            .await?;
        Ok(entry)
    }

    pub async fn delete(&self, actor_id: &str, target: &str) -> Result<(), Error> {
        let key = DocKey::edge(self.kind, actor_id, target);
        let snapshot = self.adapter.read(std::slice::from_ref(&key)).await?;
        if snapshot.get(&key).is_none() {
            return Err(Error::NotFound);
        }
        self.adapter
            .commit(&snapshot.expectations(), vec![Write::Delete(key)])
            .await
    }

    /// Every entry the actor holds in this ledger, oldest first.
    pub async fn list_by_actor(&self, actor_id: &str) -> Result<Vec<LedgerEntry>, Error> {
        self.adapter
            .query_edges(self.kind.type_name(), actor_id)
            .await?
            .into_iter()
            .map(EdgeRecord::to_entry)
            .collect()
    }
}
