use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::DayKey,
    lock::Lockable,
    object::{Meta, Object, pair_key, sorted_pair},
    query::IndexMeta,
    streak::StreakUpdate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Active,
    Broken,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Broken => "broken",
        }
    }
}

/// Shared entity derived from mutual favorites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    #[serde(rename = "_meta")]
    pub meta: Meta,
    pub participant_ids: [String; 2],
    pub last_mutual_at: DateTime<Utc>,
    pub streak_count: u32,
    pub is_locked: bool,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_streak_date: DayKey,
    pub status: ConnectionStatus,
}

impl Connection {
    pub fn establish(
        a: &str,
        b: &str,
        now: DateTime<Utc>,
        today: DayKey,
        lock_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: Meta::new(pair_key(a, b), now),
            participant_ids: sorted_pair(a, b),
            last_mutual_at: now,
            streak_count: 1,
            is_locked: true,
            lock_expires_at: Some(lock_expires_at),
            last_streak_date: today,
            status: ConnectionStatus::Active,
        }
    }

    /// Re-confirmed reciprocity: apply the streak step and renew the lock.
    pub fn renew(&mut self, update: StreakUpdate, now: DateTime<Utc>, lock_expires_at: DateTime<Utc>) {
        self.streak_count = update.count;
        self.last_streak_date = update.date_to_store;
        self.last_mutual_at = now;
        self.is_locked = true;
        self.lock_expires_at = Some(lock_expires_at);
        self.meta.updated_at = now;
    }
}

impl Lockable for Connection {
    fn lock_flag(&self) -> bool {
        self.is_locked
    }

    fn lock_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock_expires_at
    }
}

impl Object for Connection {
    const TYPE: &'static str = "Connection";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_meta(&self) -> IndexMeta {
        IndexMeta::new()
            .with("participant_a", self.participant_ids[0].as_str())
            .with("participant_b", self.participant_ids[1].as_str())
            .with("streak_count", self.streak_count)
            .with("status", self.status.as_str())
            .with("last_mutual_at", self.last_mutual_at)
    }
}
