use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::DayKey;

/// Indexed fields of a record, stored next to its data.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IndexMeta(pub BTreeMap<String, IndexValue>);

impl IndexMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl ToIndexValue) -> Self {
        self.0.insert(field.to_string(), value.to_index_value());
        self
    }

    pub fn meta(&self) -> &BTreeMap<String, IndexValue> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&IndexValue> {
        self.0.get(field)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    fn compare(&self, other: &IndexValue) -> Option<Ordering> {
        match (self, other) {
            (IndexValue::String(a), IndexValue::String(b)) => Some(a.cmp(b)),
            (IndexValue::Int(a), IndexValue::Int(b)) => Some(a.cmp(b)),
            (IndexValue::Bool(a), IndexValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

// Helper trait to convert types to IndexValue
pub trait ToIndexValue {
    fn to_index_value(&self) -> IndexValue;
}

impl ToIndexValue for String {
    fn to_index_value(&self) -> IndexValue {
        IndexValue::String(self.clone())
    }
}

impl ToIndexValue for &str {
    fn to_index_value(&self) -> IndexValue {
        IndexValue::String(self.to_string())
    }
}

impl ToIndexValue for i64 {
    fn to_index_value(&self) -> IndexValue {
        IndexValue::Int(*self)
    }
}

impl ToIndexValue for u32 {
    fn to_index_value(&self) -> IndexValue {
        IndexValue::Int(*self as i64)
    }
}

impl ToIndexValue for bool {
    fn to_index_value(&self) -> IndexValue {
        IndexValue::Bool(*self)
    }
}

/// Timestamps are indexed as epoch milliseconds so every backend can compare them.
impl ToIndexValue for chrono::DateTime<chrono::Utc> {
    fn to_index_value(&self) -> IndexValue {
        IndexValue::Int(self.timestamp_millis())
    }
}

impl ToIndexValue for DayKey {
    fn to_index_value(&self) -> IndexValue {
        IndexValue::String(self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    GreaterThan,
}

impl Comparison {
    pub fn sql(&self) -> &'static str {
        match self {
            Comparison::Equal => "=",
            Comparison::GreaterThan => ">",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub field: &'static str,
    pub value: IndexValue,
    pub comparison: Comparison,
}

impl QueryFilter {
    pub fn matches(&self, meta: &IndexMeta) -> bool {
        let Some(stored) = meta.get(self.field) else {
            return false;
        };
        match (self.comparison, stored.compare(&self.value)) {
            (Comparison::Equal, Some(ord)) => ord == Ordering::Equal,
            (Comparison::GreaterThan, Some(ord)) => ord == Ordering::Greater,
            (_, None) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySort {
    pub field: &'static str,
    pub ascending: bool,
}

/// Object query plan (storage contract)
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<QueryFilter>,
    pub sort: Option<QuerySort>,
    pub limit: Option<u32>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    // Equality
    pub fn where_eq(mut self, field: &'static str, value: impl ToIndexValue) -> Self {
        self.filters.push(QueryFilter {
            field,
            value: value.to_index_value(),
            comparison: Comparison::Equal,
        });
        self
    }

    // Greater Than
    pub fn where_gt(mut self, field: &'static str, value: impl ToIndexValue) -> Self {
        self.filters.push(QueryFilter {
            field,
            value: value.to_index_value(),
            comparison: Comparison::GreaterThan,
        });
        self
    }

    pub fn sort_asc(mut self, field: &'static str) -> Self {
        self.sort = Some(QuerySort {
            field,
            ascending: true,
        });
        self
    }

    pub fn sort_desc(mut self, field: &'static str) -> Self {
        self.sort = Some(QuerySort {
            field,
            ascending: false,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, meta: &IndexMeta) -> bool {
        self.filters.iter().all(|f| f.matches(meta))
    }

    /// Ordering of two index rows under this query's sort; equal when unsorted.
    pub fn order(&self, a: &IndexMeta, b: &IndexMeta) -> Ordering {
        let Some(sort) = self.sort else {
            return Ordering::Equal;
        };
        let ord = match (a.get(sort.field), b.get(sort.field)) {
            (Some(x), Some(y)) => x.compare(y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if sort.ascending { ord } else { ord.reverse() }
    }

    /// Field names end up in SQL text, so only plain identifiers are allowed.
    pub(crate) fn validate_fields(&self) -> Result<(), crate::error::Error> {
        let fields = self
            .filters
            .iter()
            .map(|f| f.field)
            .chain(self.sort.iter().map(|s| s.field));
        for field in fields {
            if field.is_empty()
                || !field
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(crate::error::Error::invalid(format!(
                    "unsupported index field {:?}",
                    field
                )));
            }
        }
        Ok(())
    }
}
