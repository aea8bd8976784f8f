pub mod meta;

pub use meta::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which ledger an entry lives in. Both ledgers share one entry shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerKind {
    Favorite,
    Highlight,
}

impl LedgerKind {
    pub const fn type_name(&self) -> &'static str {
        match self {
            LedgerKind::Favorite => "Favorite",
            LedgerKind::Highlight => "Highlight",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Favorite => "favorite",
            LedgerKind::Highlight => "highlight",
        }
    }
}

/// One actor's unilateral declaration of interest.
///
/// Favorites point at the counterpart's actor id, highlights at the content
/// key of a message. The entry is created on add, deleted on remove, and
/// never mutated in between.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    #[serde(rename = "_meta")]
    pub meta: EdgeMeta,
    pub kind: LedgerKind,
    /// Key the actor used to reach the target (rotating key or content key).
    pub target_key: String,
    pub counterpart_id: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        kind: LedgerKind,
        actor_id: &str,
        target_doc: &str,
        target_key: &str,
        counterpart_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: EdgeMeta::new(actor_id, target_doc),
            kind,
            target_key: target_key.to_string(),
            counterpart_id: counterpart_id.to_string(),
            created_at: now,
        }
    }

    pub fn actor_id(&self) -> &str {
        self.meta.from()
    }

    pub fn target(&self) -> &str {
        self.meta.to()
    }
}
