pub mod atomic;
pub mod intent;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub use atomic::{Transaction, run_atomic};
pub use intent::{Intent, Outcome, Target};

use crate::{
    adapters::{Adapter, DocKey},
    clock::{DayClock, DayKey},
    collab::{IdentityResolver, Notifier},
    config::Config,
    edge::{LedgerEntry, LedgerKind},
    error::Error,
    lock::LockPolicy,
    object::{Connection, QueuedStory, pair_key, validate_key},
    streak::StreakCalculator,
};

/// What a committed apply did to the shared entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    Untouched,
    Created,
    Renewed,
}

/// Actor and counterpart after identity resolution, with the document keys
/// one apply reads.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub actor_id: String,
    pub counterpart_id: String,
    pub target: Target,
}

impl Resolved {
    pub fn kind(&self) -> LedgerKind {
        self.target.kind()
    }

    pub fn shared_id(&self) -> String {
        match &self.target {
            Target::Favorite { .. } => pair_key(&self.actor_id, &self.counterpart_id),
            Target::Highlight { message, .. } => message.content_key(),
        }
    }

    pub fn actor_entry_key(&self) -> DocKey {
        DocKey::edge(self.kind(), &self.actor_id, &self.ledger_target(&self.actor_id))
    }

    pub fn counterpart_entry_key(&self) -> DocKey {
        DocKey::edge(
            self.kind(),
            &self.counterpart_id,
            &self.ledger_target(&self.counterpart_id),
        )
    }

    pub fn shared_key(&self) -> DocKey {
        match self.kind() {
            LedgerKind::Favorite => DocKey::object::<Connection>(&self.shared_id()),
            LedgerKind::Highlight => DocKey::object::<QueuedStory>(&self.shared_id()),
        }
    }

    /// Actor entry, counterpart entry, shared entity.
    pub fn keys(&self) -> [DocKey; 3] {
        [
            self.actor_entry_key(),
            self.counterpart_entry_key(),
            self.shared_key(),
        ]
    }

    /// `to` side of `of`'s ledger entry: the other actor for favorites, the
    /// message for highlights.
    fn ledger_target(&self, of: &str) -> String {
        match &self.target {
            Target::Favorite { .. } if of == self.actor_id => self.counterpart_id.clone(),
            Target::Favorite { .. } => self.actor_id.clone(),
            Target::Highlight { message, .. } => message.content_key(),
        }
    }

    fn conversation_key(&self) -> String {
        match &self.target {
            Target::Favorite { .. } => self.shared_id(),
            Target::Highlight { message, .. } => message.conversation_id.clone(),
        }
    }
}

/// Instant-dependent inputs of one transaction attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Moment {
    pub now: DateTime<Utc>,
    pub today: DayKey,
    pub lock_expiry: DateTime<Utc>,
}

impl Moment {
    pub fn of(policy: &LockPolicy) -> Self {
        let clock = policy.clock();
        let now = clock.now();
        Self {
            now,
            today: clock.day_of(now),
            lock_expiry: policy.lock_expiry_at(now),
        }
    }
}

fn describe_connection(outcome: &mut Outcome, conn: &Connection, now: DateTime<Utc>) {
    outcome.lock_expires_at = LockPolicy::active_expiry_at(conn, now);
    outcome.locked = outcome.lock_expires_at.is_some();
    outcome.streak_count = Some(conn.streak_count);
}

fn describe_story(outcome: &mut Outcome, story: &QueuedStory, now: DateTime<Utc>) {
    outcome.lock_expires_at = LockPolicy::active_expiry_at(story, now);
    outcome.locked = outcome.lock_expires_at.is_some();
    outcome.story_status = Some(story.status);
}

/// Validate and plan one apply over a snapshot of [`Resolved::keys`].
///
/// Pure: everything it needs was read into the transaction's snapshot.
pub(crate) fn plan_apply(
    tx: &mut Transaction<'_>,
    resolved: &Resolved,
    intent: Intent,
    at: Moment,
) -> Result<(Outcome, Effect), Error> {
    let snapshot = tx.snapshot();
    let kind = resolved.kind();
    let actor_key = resolved.actor_entry_key();
    let shared_id = resolved.shared_id();
    let mut outcome = Outcome::new(kind, intent);

    let connection = match kind {
        LedgerKind::Favorite => snapshot.object::<Connection>(&shared_id)?,
        LedgerKind::Highlight => None,
    };
    let story = match kind {
        LedgerKind::Highlight => snapshot.object::<QueuedStory>(&shared_id)?,
        LedgerKind::Favorite => None,
    };

    match intent {
        Intent::Remove => {
            if snapshot.get(&actor_key).is_none() {
                return Err(Error::NotFound);
            }
            let lock = match (&connection, &story) {
                (Some(conn), _) => LockPolicy::active_expiry_at(conn, at.now),
                (_, Some(story)) => LockPolicy::active_expiry_at(story, at.now),
                _ => None,
            };
            if let Some(until) = lock {
                return Err(Error::Locked { until });
            }

            tx.delete(actor_key)?;
            if let Some(conn) = &connection {
                describe_connection(&mut outcome, conn, at.now);
            }
            if let Some(story) = &story {
                describe_story(&mut outcome, story, at.now);
            }
            Ok((outcome, Effect::Untouched))
        }
        Intent::Add => {
            if snapshot.get(&actor_key).is_some() {
                return Err(Error::AlreadyExists);
            }

            let ledger_target = resolved.ledger_target(&resolved.actor_id);
            let entry = LedgerEntry::new(
                kind,
                &resolved.actor_id,
                &ledger_target,
                resolved.target.counterpart_key(),
                &resolved.counterpart_id,
                at.now,
            );
            tx.put_entry(&entry)?;

            let reciprocal = snapshot
                .entry(
                    kind,
                    &resolved.counterpart_id,
                    &resolved.ledger_target(&resolved.counterpart_id),
                )?
                .is_some_and(|e| e.counterpart_id == resolved.actor_id);

            if !reciprocal {
                if let Some(conn) = &connection {
                    describe_connection(&mut outcome, conn, at.now);
                }
                if let Some(story) = &story {
                    describe_story(&mut outcome, story, at.now);
                }
                return Ok((outcome, Effect::Untouched));
            }

            outcome.mutual = true;
            match (&resolved.target, connection, story) {
                (Target::Favorite { .. }, None, _) => {
                    let conn = Connection::establish(
                        &resolved.actor_id,
                        &resolved.counterpart_id,
                        at.now,
                        at.today,
                        at.lock_expiry,
                    );
                    tx.put_object(&conn)?;
                    outcome.established = true;
                    describe_connection(&mut outcome, &conn, at.now);
                    Ok((outcome, Effect::Created))
                }
                (Target::Favorite { .. }, Some(mut conn), _) => {
                    let update =
                        StreakCalculator::next(Some(conn.last_streak_date), at.today, conn.streak_count);
                    conn.renew(update, at.now, at.lock_expiry);
                    tx.put_object(&conn)?;
                    outcome.established = true;
                    describe_connection(&mut outcome, &conn, at.now);
                    Ok((outcome, Effect::Renewed))
                }
                (Target::Highlight { message, .. }, _, None) => {
                    let story = QueuedStory::queue(
                        &resolved.actor_id,
                        &resolved.counterpart_id,
                        message.clone(),
                        at.now,
                        at.lock_expiry,
                    );
                    tx.put_object(&story)?;
                    outcome.established = true;
                    describe_story(&mut outcome, &story, at.now);
                    Ok((outcome, Effect::Created))
                }
                // a story is created once; later highlights never re-trigger it
                (Target::Highlight { .. }, _, Some(story)) => {
                    describe_story(&mut outcome, &story, at.now);
                    Ok((outcome, Effect::Untouched))
                }
            }
        }
    }
}

/// The transactional core: turns one actor's intent into ledger writes and,
/// on reciprocity, into a shared entity.
#[derive(Clone)]
pub struct MutualStateEngine {
    adapter: Arc<dyn Adapter>,
    resolver: Arc<dyn IdentityResolver>,
    notifier: Arc<dyn Notifier>,
    policy: LockPolicy,
    config: Config,
}

impl MutualStateEngine {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        resolver: Arc<dyn IdentityResolver>,
        notifier: Arc<dyn Notifier>,
        clock: DayClock,
        config: Config,
    ) -> Self {
        Self {
            adapter,
            resolver,
            notifier,
            policy: LockPolicy::new(clock),
            config,
        }
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Validate keys and resolve the counterpart. Runs before any
    /// transaction.
    pub(crate) async fn resolve(&self, actor_id: &str, target: &Target) -> Result<Resolved, Error> {
        validate_key("actor id", actor_id)?;
        validate_key("target key", target.counterpart_key())?;
        if let Target::Highlight { message, .. } = target {
            message.validate()?;
        }
        if actor_id == target.counterpart_key() {
            return Err(Error::invalid("cannot target yourself"));
        }

        let counterpart_id = self
            .resolver
            .resolve(target.counterpart_key())
            .await?
            .ok_or(Error::NotFound)?;
        if counterpart_id == actor_id {
            return Err(Error::invalid("cannot target yourself"));
        }

        Ok(Resolved {
            actor_id: actor_id.to_string(),
            counterpart_id,
            target: target.clone(),
        })
    }

    /// Apply one actor's intent.
    ///
    /// [`Error::Conflict`] is retried from the read phase up to
    /// `max_conflict_retries` times before it is returned. Re-running an
    /// applied `Add` yields [`Error::AlreadyExists`].
    pub async fn apply(&self, actor_id: &str, target: Target, intent: Intent) -> Result<Outcome, Error> {
        let kind = target.kind();
        let start = Instant::now();

        let result = self.apply_inner(actor_id, target, intent).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };
        counter!("kindred.apply.total",
            "kind" => kind.as_str(),
            "intent" => intent.as_str(),
            "status" => status
        )
        .increment(1);
        histogram!("kindred.apply.duration_ms", "kind" => kind.as_str())
            .record(start.elapsed().as_secs_f64() * 1000.0);

        result
    }

    async fn apply_inner(&self, actor_id: &str, target: Target, intent: Intent) -> Result<Outcome, Error> {
        let resolved = self.resolve(actor_id, &target).await?;
        let keys = resolved.keys();

        let (outcome, effect) = run_atomic(
            self.adapter.as_ref(),
            &keys,
            self.config.max_conflict_retries,
            |tx| plan_apply(tx, &resolved, intent, Moment::of(&self.policy)),
        )
        .await?;

        debug!(
            actor = %resolved.actor_id,
            kind = resolved.kind().as_str(),
            intent = intent.as_str(),
            mutual = outcome.mutual,
            "apply committed"
        );

        match effect {
            Effect::Untouched => {}
            Effect::Created => info!(
                id = %resolved.shared_id(),
                kind = resolved.kind().as_str(),
                "shared entity created"
            ),
            Effect::Renewed => info!(
                id = %resolved.shared_id(),
                streak = outcome.streak_count.unwrap_or_default(),
                "connection renewed"
            ),
        }

        if effect != Effect::Untouched {
            self.notify(&resolved, effect, &outcome);
        }

        Ok(outcome)
    }

    /// Fire and forget. Runs after commit and never affects the result.
    fn notify(&self, resolved: &Resolved, effect: Effect, outcome: &Outcome) {
        if !self.config.notifications {
            return;
        }

        let text = match (resolved.kind(), effect) {
            (LedgerKind::Favorite, Effect::Created) => "You favorited each other. You are now connected.".to_string(),
            (LedgerKind::Favorite, _) => format!(
                "Connection renewed. Streak: {} day(s).",
                outcome.streak_count.unwrap_or(1)
            ),
            (LedgerKind::Highlight, _) => "You both highlighted this message. It was sent for review.".to_string(),
        };
        let conversation = resolved.conversation_key();
        let notifier = self.notifier.clone();

        tokio::spawn(async move {
            if let Err(err) = notifier.post(&conversation, &text).await {
                counter!("kindred.notify.failures").increment(1);
                warn!(conversation = %conversation, error = %err, "notification failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        adapters::{EdgeRecord, ObjectRecord, Record, Snapshot},
        object::{MessageSnapshot, StoryStatus},
    };

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, h, 0, 0).unwrap()
    }

    fn moment(now: DateTime<Utc>, today: &str) -> Moment {
        Moment {
            now,
            today: DayKey::parse(today).unwrap(),
            lock_expiry: now + chrono::Duration::hours(6),
        }
    }

    fn favorite(actor: &str, other: &str) -> Resolved {
        Resolved {
            actor_id: actor.to_string(),
            counterpart_id: other.to_string(),
            target: Target::favorite(format!("{}-key", other)),
        }
    }

    fn highlight(actor: &str, other: &str) -> Resolved {
        let message = MessageSnapshot::new("c1", "m1", other, "hi", at(1));
        Resolved {
            actor_id: actor.to_string(),
            counterpart_id: other.to_string(),
            target: Target::highlight(format!("{}-key", other), message),
        }
    }

    fn empty(resolved: &Resolved) -> Snapshot {
        let mut snap = Snapshot::new();
        for key in resolved.keys() {
            snap.insert(key, None);
        }
        snap
    }

    fn with_entry(snap: &mut Snapshot, kind: LedgerKind, from: &str, to: &str, counterpart: &str) {
        let entry = LedgerEntry::new(kind, from, to, "k", counterpart, at(0));
        let mut record = EdgeRecord::from_entry(&entry).unwrap();
        record.version = 1;
        snap.insert(record.key(), Some(Record::Edge(record)));
    }

    fn with_connection(snap: &mut Snapshot, conn: &Connection) {
        let mut record = ObjectRecord::from_object(conn).unwrap();
        record.version = 1;
        snap.insert(record.key(), Some(Record::Object(record)));
    }

    #[test]
    fn test_keys_are_symmetric() {
        let ab = favorite("alice", "bob");
        let ba = favorite("bob", "alice");
        assert_eq!(ab.shared_key(), ba.shared_key());
        assert_eq!(ab.actor_entry_key(), ba.counterpart_entry_key());
        assert_eq!(ab.actor_entry_key(), DocKey::edge(LedgerKind::Favorite, "alice", "bob"));

        let h = highlight("alice", "bob");
        assert_eq!(h.shared_key(), DocKey::object::<QueuedStory>("c1~m1"));
        assert_eq!(h.counterpart_entry_key(), DocKey::edge(LedgerKind::Highlight, "bob", "c1~m1"));
    }

    #[test]
    fn test_one_sided_add_writes_only_the_entry() {
        let resolved = favorite("alice", "bob");
        let snap = empty(&resolved);
        let mut tx = Transaction::new(&snap);

        let (outcome, effect) = plan_apply(&mut tx, &resolved, Intent::Add, moment(at(10), "2024-05-02")).unwrap();

        assert_eq!(effect, Effect::Untouched);
        assert!(!outcome.mutual);
        let writes = tx.into_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].key(), resolved.actor_entry_key());
    }

    #[test]
    fn test_reciprocal_add_creates_connection() {
        let resolved = favorite("bob", "alice");
        let mut snap = empty(&resolved);
        with_entry(&mut snap, LedgerKind::Favorite, "alice", "bob", "bob");
        let mut tx = Transaction::new(&snap);
        let m = moment(at(10), "2024-05-02");

        let (outcome, effect) = plan_apply(&mut tx, &resolved, Intent::Add, m).unwrap();

        assert_eq!(effect, Effect::Created);
        assert!(outcome.mutual && outcome.established && outcome.locked);
        assert_eq!(outcome.streak_count, Some(1));
        assert_eq!(outcome.lock_expires_at, Some(m.lock_expiry));
        assert_eq!(tx.into_writes().len(), 2);
    }

    #[test]
    fn test_duplicate_add() {
        let resolved = favorite("alice", "bob");
        let mut snap = empty(&resolved);
        with_entry(&mut snap, LedgerKind::Favorite, "alice", "bob", "bob");
        let mut tx = Transaction::new(&snap);

        let result = plan_apply(&mut tx, &resolved, Intent::Add, moment(at(10), "2024-05-02"));
        assert_eq!(result, Err(Error::AlreadyExists));
    }

    #[test]
    fn test_remove_missing_entry() {
        let resolved = favorite("alice", "bob");
        let snap = empty(&resolved);
        let mut tx = Transaction::new(&snap);

        let result = plan_apply(&mut tx, &resolved, Intent::Remove, moment(at(10), "2024-05-02"));
        assert_eq!(result, Err(Error::NotFound));
    }

    #[test]
    fn test_remove_respects_lock() {
        let resolved = favorite("alice", "bob");
        let mut snap = empty(&resolved);
        with_entry(&mut snap, LedgerKind::Favorite, "alice", "bob", "bob");
        let expiry = at(18);
        let conn = Connection::establish("alice", "bob", at(9), DayKey::parse("2024-05-02").unwrap(), expiry);
        with_connection(&mut snap, &conn);

        let mut tx = Transaction::new(&snap);
        let locked = plan_apply(&mut tx, &resolved, Intent::Remove, moment(at(10), "2024-05-02"));
        assert_eq!(locked, Err(Error::Locked { until: expiry }));

        let mut tx = Transaction::new(&snap);
        let (outcome, _) = plan_apply(&mut tx, &resolved, Intent::Remove, moment(at(19), "2024-05-02")).unwrap();
        assert!(!outcome.locked);
        assert_eq!(outcome.streak_count, Some(1));
        assert_eq!(tx.into_writes(), vec![crate::adapters::Write::Delete(resolved.actor_entry_key())]);
    }

    #[test]
    fn test_renewal_next_day_extends_streak() {
        let resolved = favorite("bob", "alice");
        let mut snap = empty(&resolved);
        with_entry(&mut snap, LedgerKind::Favorite, "alice", "bob", "bob");
        let conn = Connection::establish("alice", "bob", at(9), DayKey::parse("2024-05-01").unwrap(), at(0));
        with_connection(&mut snap, &conn);
        let mut tx = Transaction::new(&snap);

        let (outcome, effect) = plan_apply(&mut tx, &resolved, Intent::Add, moment(at(10), "2024-05-02")).unwrap();

        assert_eq!(effect, Effect::Renewed);
        assert_eq!(outcome.streak_count, Some(2));
        assert!(outcome.locked);
    }

    #[test]
    fn test_existing_story_is_left_alone() {
        let resolved = highlight("bob", "alice");
        let mut snap = empty(&resolved);
        with_entry(&mut snap, LedgerKind::Highlight, "alice", "c1~m1", "bob");
        let message = MessageSnapshot::new("c1", "m1", "alice", "hi", at(1));
        let story = QueuedStory::queue("alice", "bob", message, at(2), at(3));
        let mut record = ObjectRecord::from_object(&story).unwrap();
        record.version = 1;
        snap.insert(record.key(), Some(Record::Object(record)));
        let mut tx = Transaction::new(&snap);

        let (outcome, effect) = plan_apply(&mut tx, &resolved, Intent::Add, moment(at(10), "2024-05-02")).unwrap();

        assert_eq!(effect, Effect::Untouched);
        assert!(outcome.mutual);
        assert!(!outcome.established);
        assert_eq!(outcome.story_status, Some(StoryStatus::Pending));
        assert_eq!(tx.into_writes().len(), 1);
    }

    #[test]
    fn test_highlight_from_another_counterpart_is_not_reciprocal() {
        let resolved = highlight("bob", "alice");
        let mut snap = empty(&resolved);
        // alice highlighted the same message while talking to someone else
        with_entry(&mut snap, LedgerKind::Highlight, "alice", "c1~m1", "carol");
        let mut tx = Transaction::new(&snap);

        let (outcome, effect) = plan_apply(&mut tx, &resolved, Intent::Add, moment(at(10), "2024-05-02")).unwrap();
        assert_eq!(effect, Effect::Untouched);
        assert!(!outcome.mutual);
    }
}
