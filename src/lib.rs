//! # Kindred
//!
//! Kindred turns two independent, one-sided signals into one shared fact.
//! Two people favorite each other and a **connection** appears, carrying a
//! day streak. Two people highlight the same message and a **story** is
//! queued for review, then published for a fixed window once approved.
//!
//! ## What's inside
//!
//! ### Ledgers
//! Each actor owns a favorite ledger and a highlight ledger: one entry per
//! target, created on add and deleted on remove.
//!
//! ### Mutual-state engine
//! Every add or remove runs as one optimistic transaction over exactly three
//! documents: the actor's entry, the counterpart's entry and the shared
//! entity. Reads come first, writes are conditional on the versions read,
//! and a conflict restarts the attempt from the read phase. Shared entity
//! ids are order independent, so both sides converge on the same document.
//!
//! ### Daily reset clock
//! One fixed UTC offset decides what "today" is. Streaks compare calendar
//! days in it and every lock expires at its next midnight, so a match just
//! before the reset yields a short lock and one just after a long one.
//!
//! ### Review
//! Queued stories move `pending -> approved` (blocked while locked) or
//! `pending -> rejected`. Approval publishes an anonymized copy that stays
//! visible for a rolling window.
//!
//! ### Live status
//! [`Engine::subscribe`] folds the three documents of a pair into a
//! [`StatusSnapshot`] and re-derives it on every commit touching them and
//! whenever a displayed lock runs out.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use kindred::{Engine, MemoryAdapter, StaticResolver};
//!
//! let resolver = StaticResolver::identity(["alice", "bob"]);
//! let engine = Engine::new(Box::new(MemoryAdapter::new()), resolver);
//!
//! engine.favorite("alice", "bob").await?;
//! let outcome = engine.favorite("bob", "alice").await?;
//! assert!(outcome.established);
//! assert_eq!(outcome.streak_count, Some(1));
//! ```
//!
//! ## Feature flags
//!
//! | Flag       | Default | Description                        |
//! |------------|---------|------------------------------------|
//! | `sqlite`   | ✓       | SQLite adapter (in-memory or file)  |
//! | `postgres` |         | PostgreSQL adapter via sqlx         |
//! | `full`     |         | Both adapters                       |

pub mod adapters;
pub mod clock;
pub mod collab;
pub mod config;
pub mod edge;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod object;
pub mod query;
pub mod review;
pub mod status;
pub mod streak;

use std::sync::Arc;

use chrono::{Offset, Utc};

pub use crate::adapters::{Adapter, DocKey, EdgeRecord, MemoryAdapter, ObjectRecord};
pub use crate::clock::{Clock, DayClock, DayKey, ManualClock, SystemClock};
pub use crate::collab::{
    ChannelNotifier, IdentityResolver, NoopNotifier, Notification, Notifier, StaticResolver,
};
pub use crate::config::Config;
pub use crate::edge::{LedgerEntry, LedgerKind};
pub use crate::engine::{Intent, MutualStateEngine, Outcome, Target};
pub use crate::error::{Error, ErrorKind};
pub use crate::ledger::LedgerStore;
pub use crate::lock::{LockPolicy, Lockable};
pub use crate::object::*;
pub use crate::query::Query;
pub use crate::review::{Decision, ReviewOutcome, ReviewWorkflow};
pub use crate::status::{StatusSnapshot, StatusWatch};
pub use crate::streak::{StreakCalculator, StreakStep, StreakUpdate};

/// Everything an engine is assembled from.
#[derive(Clone)]
struct Settings {
    adapter: Arc<dyn Adapter>,
    resolver: Arc<dyn IdentityResolver>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: Config,
}

/// The Engine is the entry point for UI and admin callers.
/// Cheap to clone; clones share the same store and collaborators.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Kindred>,
}

pub struct Kindred {
    settings: Settings,
    day_clock: DayClock,
    mutual: MutualStateEngine,
    review: ReviewWorkflow,
}

impl Engine {
    /// Engine on the system clock with the default [`Config`] and no
    /// notifications sink.
    pub fn new(adapter: Box<dyn Adapter>, resolver: impl IdentityResolver) -> Self {
        Self::assemble(Settings {
            adapter: Arc::from(adapter),
            resolver: Arc::new(resolver),
            notifier: Arc::new(NoopNotifier),
            clock: Arc::new(SystemClock),
            config: Config::default(),
        })
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        let mut settings = self.inner.settings.clone();
        settings.clock = clock;
        Self::assemble(settings)
    }

    pub fn with_notifier(self, notifier: impl Notifier) -> Self {
        let mut settings = self.inner.settings.clone();
        settings.notifier = Arc::new(notifier);
        Self::assemble(settings)
    }

    /// Fails with [`Error::InvalidArgument`] on an out-of-range offset or
    /// public window.
    pub fn with_config(self, config: Config) -> Result<Self, Error> {
        config.validate()?;
        let mut settings = self.inner.settings.clone();
        settings.config = config;
        Ok(Self::assemble(settings))
    }

    fn assemble(settings: Settings) -> Self {
        // offsets are validated before they get here
        let offset = settings.config.offset().unwrap_or_else(|_| Utc.fix());
        let day_clock = DayClock::new(settings.clock.clone(), offset);
        let mutual = MutualStateEngine::new(
            settings.adapter.clone(),
            settings.resolver.clone(),
            settings.notifier.clone(),
            day_clock.clone(),
            settings.config.clone(),
        );
        let review = ReviewWorkflow::new(
            settings.adapter.clone(),
            LockPolicy::new(day_clock.clone()),
            settings.config.clone(),
        );

        Self {
            inner: Arc::new(Kindred {
                settings,
                day_clock,
                mutual,
                review,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.settings.config
    }

    pub fn day_clock(&self) -> &DayClock {
        &self.inner.day_clock
    }

    pub fn adapter(&self) -> &dyn Adapter {
        self.inner.settings.adapter.as_ref()
    }

    /// -----------------------------
    /// Mutual state
    /// -----------------------------

    pub async fn apply(&self, actor_id: &str, target: Target, intent: Intent) -> Result<Outcome, Error> {
        self.inner.mutual.apply(actor_id, target, intent).await
    }

    pub async fn favorite(&self, actor_id: &str, target_key: &str) -> Result<Outcome, Error> {
        self.apply(actor_id, Target::favorite(target_key), Intent::Add).await
    }

    pub async fn unfavorite(&self, actor_id: &str, target_key: &str) -> Result<Outcome, Error> {
        self.apply(actor_id, Target::favorite(target_key), Intent::Remove)
            .await
    }

    pub async fn highlight(
        &self,
        actor_id: &str,
        counterpart_key: &str,
        message: MessageSnapshot,
    ) -> Result<Outcome, Error> {
        self.apply(actor_id, Target::highlight(counterpart_key, message), Intent::Add)
            .await
    }

    pub async fn unhighlight(
        &self,
        actor_id: &str,
        counterpart_key: &str,
        message: MessageSnapshot,
    ) -> Result<Outcome, Error> {
        self.apply(actor_id, Target::highlight(counterpart_key, message), Intent::Remove)
            .await
    }

    /// -----------------------------
    /// Status
    /// -----------------------------

    /// One-shot status of `actor_id` towards `target`.
    pub async fn status(&self, actor_id: &str, target: Target) -> Result<StatusSnapshot, Error> {
        let resolved = self.inner.mutual.resolve(actor_id, &target).await?;
        status::project(self.adapter(), &resolved, &self.inner.day_clock).await
    }

    /// Live status of `actor_id` towards `target`.
    pub async fn subscribe(&self, actor_id: &str, target: Target) -> Result<StatusWatch, Error> {
        let resolved = self.inner.mutual.resolve(actor_id, &target).await?;
        StatusWatch::spawn(
            self.inner.settings.adapter.clone(),
            self.inner.day_clock.clone(),
            resolved,
        )
        .await
    }

    /// -----------------------------
    /// Review
    /// -----------------------------

    pub async fn review(
        &self,
        story_id: &str,
        decision: Decision,
        admin_id: &str,
        reason: Option<String>,
    ) -> Result<ReviewOutcome, Error> {
        self.inner
            .review
            .review(story_id, decision, admin_id, reason)
            .await
    }

    pub async fn list_pending(&self) -> Result<Vec<QueuedStory>, Error> {
        self.inner.review.list_pending().await
    }

    pub async fn list_public(&self, limit: u32) -> Result<Vec<ApprovedStory>, Error> {
        self.inner.review.list_public(limit).await
    }

    /// -----------------------------
    /// Reads
    /// -----------------------------

    pub fn ledger(&self, kind: LedgerKind) -> LedgerStore {
        LedgerStore::new(self.inner.settings.adapter.clone(), kind)
    }

    pub async fn favorites(&self, actor_id: &str) -> Result<Vec<LedgerEntry>, Error> {
        self.ledger(LedgerKind::Favorite).list_by_actor(actor_id).await
    }

    pub async fn highlights(&self, actor_id: &str) -> Result<Vec<LedgerEntry>, Error> {
        self.ledger(LedgerKind::Highlight)
            .list_by_actor(actor_id)
            .await
    }

    /// Every connection `actor_id` takes part in, most recently renewed first.
    pub async fn connections(&self, actor_id: &str) -> Result<Vec<Connection>, Error> {
        let mut connections = Vec::new();
        for field in ["participant_a", "participant_b"] {
            let records = self
                .adapter()
                .query_objects(Connection::TYPE, Query::new().where_eq(field, actor_id))
                .await?;
            for record in records {
                connections.push(record.to_object::<Connection>()?);
            }
        }
        connections.sort_by(|a, b| {
            b.last_mutual_at
                .cmp(&a.last_mutual_at)
                .then_with(|| a.meta.id.cmp(&b.meta.id))
        });
        Ok(connections)
    }

    pub async fn connection(&self, a: &str, b: &str) -> Result<Option<Connection>, Error> {
        self.fetch_object::<Connection>(&pair_key(a, b)).await
    }

    pub async fn story(&self, story_id: &str) -> Result<Option<QueuedStory>, Error> {
        self.fetch_object::<QueuedStory>(story_id).await
    }

    pub async fn fetch_object<T: Object>(&self, id: &str) -> Result<Option<T>, Error> {
        match self.adapter().fetch_object(T::TYPE, id).await? {
            Some(record) => record.to_object().map(Some),
            None => Ok(None),
        }
    }
}
