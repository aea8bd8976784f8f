use metrics::counter;
use tracing::{debug, warn};

use crate::{
    Object,
    adapters::{Adapter, DocKey, EdgeRecord, ObjectRecord, Record, Snapshot, Write},
    edge::LedgerEntry,
    error::Error,
};

/// Write buffer for one transaction attempt.
///
/// Only documents present in the snapshot may be written: the store detects
/// conflicts on what was read, so a write to anything else would commit
/// blind.
pub struct Transaction<'s> {
    snapshot: &'s Snapshot,
    writes: Vec<Write>,
}

impl<'s> Transaction<'s> {
    pub fn new(snapshot: &'s Snapshot) -> Self {
        Self {
            snapshot,
            writes: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> &'s Snapshot {
        self.snapshot
    }

    pub fn put_object<T: Object>(&mut self, obj: &T) -> Result<(), Error> {
        let record = Record::Object(ObjectRecord::from_object(obj)?);
        self.push(Write::Put(record))
    }

    pub fn put_entry(&mut self, entry: &LedgerEntry) -> Result<(), Error> {
        let record = Record::Edge(EdgeRecord::from_entry(entry)?);
        self.push(Write::Put(record))
    }

    pub fn delete(&mut self, key: DocKey) -> Result<(), Error> {
        self.push(Write::Delete(key))
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }

    fn push(&mut self, write: Write) -> Result<(), Error> {
        let key = write.key();
        if !self.snapshot.contains(&key) {
            return Err(Error::Storage(format!(
                "write to {:?} which was not read in this transaction",
                key
            )));
        }
        self.writes.push(write);
        Ok(())
    }
}

/// Read `keys`, plan writes over the snapshot, commit conditional on the read
/// versions.
///
/// `plan` is pure and runs once per attempt; on [`Error::Conflict`] the whole
/// attempt restarts from the read phase, at most `retries` more times. Any
/// error returned by `plan` aborts without writing.
pub async fn run_atomic<R, F>(
    adapter: &dyn Adapter,
    keys: &[DocKey],
    retries: u32,
    mut plan: F,
) -> Result<R, Error>
where
    F: FnMut(&mut Transaction<'_>) -> Result<R, Error>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        debug!(attempt, keys = keys.len(), "transaction attempt");

        let snapshot = adapter.read(keys).await?;
        let mut tx = Transaction::new(&snapshot);
        let result = plan(&mut tx)?;
        if tx.is_empty() {
            return Ok(result);
        }

        match adapter.commit(&snapshot.expectations(), tx.into_writes()).await {
            Ok(()) => return Ok(result),
            Err(Error::Conflict) => {
                counter!("kindred.transaction.conflicts").increment(1);
                if attempt > retries {
                    warn!(attempt, "transaction conflicted, retries exhausted");
                    return Err(Error::Conflict);
                }
                warn!(attempt, "transaction conflicted, retrying from read phase");
            }
            Err(err) => return Err(err),
        }
    }
}
