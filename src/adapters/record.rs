use crate::{
    Object,
    edge::LedgerEntry,
    error::Error,
    query::IndexMeta,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DocKey;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectRecord {
    pub id: String,
    pub type_name: String,
    /// 0 until the record is first stored.
    pub version: i64,
    pub data: serde_json::Value,
    pub index_meta: IndexMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub fn to_object<T: Object>(self) -> Result<T, Error> {
        if self.type_name != T::TYPE {
            return Err(Error::TypeMismatch);
        }

        let mut val = serde_json::from_value::<T>(self.data)
            .map_err(|e| Error::Deserialize(e.to_string()))?;
        let meta = val.meta_mut();
        meta.id = self.id;
        meta.created_at = self.created_at;
        meta.updated_at = self.updated_at;
        Ok(val)
    }

    pub fn from_object<T: Object>(obj: &T) -> Result<Self, Error> {
        let meta = obj.meta();
        Ok(Self {
            id: meta.id.clone(),
            type_name: obj.type_name().to_string(),
            version: 0,
            data: serde_json::to_value(obj).map_err(|e| Error::Serialize(e.to_string()))?,
            index_meta: obj.index_meta(),
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        })
    }

    pub fn key(&self) -> DocKey {
        DocKey::Object {
            type_name: self.type_name.clone(),
            id: self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeRecord {
    pub type_name: String,
    pub from: String,
    pub to: String,
    pub version: i64,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EdgeRecord {
    pub fn to_entry(self) -> Result<LedgerEntry, Error> {
        let mut val = serde_json::from_value::<LedgerEntry>(self.data)
            .map_err(|e| Error::Deserialize(e.to_string()))?;
        if val.kind.type_name() != self.type_name {
            return Err(Error::TypeMismatch);
        }
        val.meta.from = self.from;
        val.meta.to = self.to;
        Ok(val)
    }

    pub fn from_entry(entry: &LedgerEntry) -> Result<Self, Error> {
        Ok(Self {
            type_name: entry.kind.type_name().to_string(),
            from: entry.meta.from.clone(),
            to: entry.meta.to.clone(),
            version: 0,
            data: serde_json::to_value(entry).map_err(|e| Error::Serialize(e.to_string()))?,
            created_at: entry.created_at,
        })
    }

    pub fn key(&self) -> DocKey {
        DocKey::Edge {
            type_name: self.type_name.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
        }
    }
}

/// A stored document of either shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Object(ObjectRecord),
    Edge(EdgeRecord),
}

impl Record {
    pub fn key(&self) -> DocKey {
        match self {
            Record::Object(r) => r.key(),
            Record::Edge(r) => r.key(),
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            Record::Object(r) => r.version,
            Record::Edge(r) => r.version,
        }
    }

    pub(crate) fn set_version(&mut self, version: i64) {
        match self {
            Record::Object(r) => r.version = version,
            Record::Edge(r) => r.version = version,
        }
    }
}
