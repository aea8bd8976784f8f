use serde::{Deserialize, Serialize};

/// Endpoints of a ledger edge: the actor and the document it points at.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EdgeMeta {
    pub from: String,
    pub to: String,
}

impl EdgeMeta {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }
}
