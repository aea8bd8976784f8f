use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    edge::LedgerKind,
    object::{MessageSnapshot, StoryStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Add,
    Remove,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Add => "add",
            Intent::Remove => "remove",
        }
    }
}

/// What an actor points a ledger entry at.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// The counterpart, reached through their current rotating key.
    Favorite { target_key: String },
    /// A message in a conversation shared with the counterpart.
    Highlight {
        counterpart_key: String,
        message: MessageSnapshot,
    },
}

impl Target {
    pub fn favorite(target_key: impl Into<String>) -> Self {
        Target::Favorite {
            target_key: target_key.into(),
        }
    }

    pub fn highlight(counterpart_key: impl Into<String>, message: MessageSnapshot) -> Self {
        Target::Highlight {
            counterpart_key: counterpart_key.into(),
            message,
        }
    }

    pub fn kind(&self) -> LedgerKind {
        match self {
            Target::Favorite { .. } => LedgerKind::Favorite,
            Target::Highlight { .. } => LedgerKind::Highlight,
        }
    }

    /// Rotating key that identifies the counterpart.
    pub fn counterpart_key(&self) -> &str {
        match self {
            Target::Favorite { target_key } => target_key,
            Target::Highlight {
                counterpart_key, ..
            } => counterpart_key,
        }
    }
}

/// Result of a successful [`apply`](crate::engine::MutualStateEngine::apply).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: LedgerKind,
    pub intent: Intent,
    /// Both entries exist once the call has committed.
    pub mutual: bool,
    /// The shared entity was created or renewed by this call.
    pub established: bool,
    pub locked: bool,
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Connections only.
    pub streak_count: Option<u32>,
    /// Stories only.
    pub story_status: Option<StoryStatus>,
}

impl Outcome {
    pub(crate) fn new(kind: LedgerKind, intent: Intent) -> Self {
        Self {
            kind,
            intent,
            mutual: false,
            established: false,
            locked: false,
            lock_expires_at: None,
            streak_count: None,
            story_status: None,
        }
    }
}
