use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use kindred::{
    ChannelNotifier, Config, Connection, Decision, Engine, Error, Intent, LedgerKind,
    ManualClock, MemoryAdapter, MessageSnapshot, Object, Query, StaticResolver, StoryStatus,
    Target,
};

/// Local wall time in the reset timezone (UTC+05:30), May 2024.
fn ist(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    FixedOffset::east_opt(5 * 3600 + 30 * 60)
        .unwrap()
        .with_ymd_and_hms(2024, 5, day, hour, minute, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn setup(now: DateTime<Utc>) -> (Engine, ManualClock) {
    let clock = ManualClock::new(now);
    let resolver = StaticResolver::identity(["alice", "bob", "carol"]);
    let engine = Engine::new(Box::new(MemoryAdapter::new()), resolver)
        .with_clock(Arc::new(clock.clone()));
    (engine, clock)
}

fn message(id: &str) -> MessageSnapshot {
    MessageSnapshot::new("conv-ab", id, "alice", "see you at sunrise", ist(2, 9, 0))
}

async fn count_connections(engine: &Engine) -> usize {
    engine
        .adapter()
        .query_objects(Connection::TYPE, Query::new())
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_mutual_favorites_create_one_connection_in_either_order() {
    for (first, second) in [("alice", "bob"), ("bob", "alice")] {
        let (engine, _) = setup(ist(2, 10, 0));

        let one_sided = engine.favorite(first, second).await.unwrap();
        assert!(!one_sided.mutual);
        assert!(!one_sided.established);
        assert_eq!(count_connections(&engine).await, 0);

        let outcome = engine.favorite(second, first).await.unwrap();
        assert!(outcome.mutual);
        assert!(outcome.established);
        assert!(outcome.locked);
        assert_eq!(outcome.streak_count, Some(1));
        assert_eq!(outcome.lock_expires_at, Some(ist(3, 0, 0)));

        let conn = engine.connection("alice", "bob").await.unwrap().unwrap();
        assert_eq!(conn.meta.id(), "alice~bob");
        assert_eq!(conn.participant_ids, ["alice".to_string(), "bob".to_string()]);
        assert_eq!(conn.streak_count, 1);
        assert!(conn.is_locked);
        assert_eq!(count_connections(&engine).await, 1);
    }
}

#[tokio::test]
async fn test_same_day_reciprocity_keeps_streak() {
    let (engine, clock) = setup(ist(2, 10, 0));
    engine.favorite("alice", "bob").await.unwrap();
    engine.favorite("bob", "alice").await.unwrap();

    // bypass the lock through the raw ledger to re-trigger on the same day
    let favorites = engine.ledger(LedgerKind::Favorite);
    for at in [ist(2, 10, 30), ist(2, 22, 0)] {
        clock.set(at);
        favorites.delete("bob", "alice").await.unwrap();
        let outcome = engine.favorite("bob", "alice").await.unwrap();
        assert!(outcome.established);
        assert_eq!(outcome.streak_count, Some(1));
    }
}

#[tokio::test]
async fn test_next_day_reciprocity_extends_streak() {
    let (engine, clock) = setup(ist(2, 23, 50));
    engine.favorite("alice", "bob").await.unwrap();
    let created = engine.favorite("bob", "alice").await.unwrap();
    // created ten minutes before the reset: a short lock
    assert_eq!(created.lock_expires_at, Some(ist(3, 0, 0)));

    clock.set(ist(3, 0, 5));
    engine.unfavorite("alice", "bob").await.unwrap();
    let renewed = engine.favorite("alice", "bob").await.unwrap();

    assert!(renewed.established);
    assert_eq!(renewed.streak_count, Some(2));
    assert_eq!(renewed.lock_expires_at, Some(ist(4, 0, 0)));
    let conn = engine.connection("alice", "bob").await.unwrap().unwrap();
    assert_eq!(conn.last_streak_date.to_string(), "2024-05-03");
}

#[tokio::test]
async fn test_skipped_day_resets_streak() {
    let (engine, clock) = setup(ist(2, 10, 0));
    engine.favorite("alice", "bob").await.unwrap();
    engine.favorite("bob", "alice").await.unwrap();

    clock.set(ist(3, 10, 0));
    engine.unfavorite("alice", "bob").await.unwrap();
    assert_eq!(engine.favorite("alice", "bob").await.unwrap().streak_count, Some(2));

    clock.set(ist(5, 10, 0));
    engine.unfavorite("alice", "bob").await.unwrap();
    let reset = engine.favorite("alice", "bob").await.unwrap();
    assert_eq!(reset.streak_count, Some(1));
}

#[tokio::test]
async fn test_lock_blocks_removal_until_boundary() {
    let (engine, clock) = setup(ist(2, 10, 0));
    engine.favorite("alice", "bob").await.unwrap();
    engine.favorite("bob", "alice").await.unwrap();

    let locked = engine.unfavorite("alice", "bob").await;
    assert_eq!(locked, Err(Error::Locked { until: ist(3, 0, 0) }));
    assert_eq!(locked.unwrap_err().locked_until(), Some(ist(3, 0, 0)));

    clock.set(ist(2, 23, 59));
    assert!(matches!(
        engine.unfavorite("bob", "alice").await,
        Err(Error::Locked { .. })
    ));

    clock.set(ist(3, 0, 0));
    let removed = engine.unfavorite("alice", "bob").await.unwrap();
    assert!(!removed.locked);
    assert!(!removed.mutual);
    // shared history survives a one-sided removal
    let conn = engine.connection("alice", "bob").await.unwrap().unwrap();
    assert_eq!(conn.streak_count, 1);
    assert_eq!(conn.status.as_str(), "active");
}

#[tokio::test]
async fn test_precondition_errors() {
    let (engine, _) = setup(ist(2, 10, 0));

    assert!(matches!(
        engine.favorite("alice", "alice").await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.favorite("alice", "a~b").await,
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(engine.favorite("alice", "nobody").await, Err(Error::NotFound));
    assert_eq!(engine.unfavorite("alice", "bob").await, Err(Error::NotFound));

    engine.favorite("alice", "bob").await.unwrap();
    assert_eq!(engine.favorite("alice", "bob").await, Err(Error::AlreadyExists));
    assert_eq!(engine.favorites("alice").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rotating_keys_resolve_to_stable_ids() {
    let clock = ManualClock::new(ist(2, 10, 0));
    let resolver = StaticResolver::new();
    resolver.insert("key-alice-1", "alice");
    resolver.insert("key-bob-1", "bob");
    let engine = Engine::new(Box::new(MemoryAdapter::new()), resolver.clone())
        .with_clock(Arc::new(clock));

    engine.favorite("alice", "key-bob-1").await.unwrap();
    resolver.rotate("bob", "key-bob-2");
    assert_eq!(engine.favorite("carol", "key-bob-1").await, Err(Error::NotFound));

    let outcome = engine.favorite("bob", "key-alice-1").await.unwrap();
    assert!(outcome.established);

    let favorites = engine.favorites("alice").await.unwrap();
    let entry = &favorites[0];
    assert_eq!(entry.target(), "bob");
    assert_eq!(entry.target_key, "key-bob-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_create_a_single_connection() {
    let (engine, _) = setup(ist(2, 10, 0));

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let (actor, target) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
        handles.push(tokio::spawn(async move { engine.favorite(actor, target).await }));
    }

    let mut succeeded = 0;
    let mut established = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                succeeded += 1;
                if outcome.established {
                    established += 1;
                }
            }
            Err(err) => assert_eq!(err, Error::AlreadyExists),
        }
    }

    assert_eq!(succeeded, 2);
    assert_eq!(established, 1);
    assert_eq!(count_connections(&engine).await, 1);
    let conn = engine.connection("bob", "alice").await.unwrap().unwrap();
    assert_eq!(conn.streak_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_highlights_queue_a_single_story() {
    let (engine, _) = setup(ist(2, 10, 0));

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let (actor, counterpart) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
        handles.push(tokio::spawn(async move {
            engine.highlight(actor, counterpart, message("m1")).await
        }));
    }
    for handle in handles {
        if let Err(err) = handle.await.unwrap() {
            assert_eq!(err, Error::AlreadyExists);
        }
    }

    let pending = engine.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].meta.id(), "conv-ab~m1");
}

#[tokio::test]
async fn test_highlights_queue_and_review_story() {
    let (engine, clock) = setup(ist(2, 10, 0));

    let first = engine.highlight("alice", "bob", message("m1")).await.unwrap();
    assert!(!first.mutual);
    assert!(engine.list_pending().await.unwrap().is_empty());

    let queued = engine.highlight("bob", "alice", message("m1")).await.unwrap();
    assert!(queued.established);
    assert_eq!(queued.story_status, Some(StoryStatus::Pending));
    assert_eq!(queued.lock_expires_at, Some(ist(3, 0, 0)));

    let story = engine.story("conv-ab~m1").await.unwrap().unwrap();
    assert_eq!(story.content_snapshot.text, "see you at sunrise");
    assert!(story.locked);

    assert_eq!(
        engine.unhighlight("alice", "bob", message("m1")).await,
        Err(Error::Locked { until: ist(3, 0, 0) })
    );
    assert_eq!(
        engine.review("conv-ab~m1", Decision::Approve, "admin-1", None).await,
        Err(Error::Locked { until: ist(3, 0, 0) })
    );

    clock.set(ist(3, 0, 1));
    let reviewed = engine
        .review("conv-ab~m1", Decision::Approve, "admin-1", None)
        .await
        .unwrap();
    let published = reviewed.published.unwrap();
    assert_eq!(published.meta.id(), "conv-ab~m1");
    assert_eq!(published.approved_at, ist(3, 0, 1));
    assert_eq!(published.expires_at, ist(4, 0, 1));
    assert_eq!(published.content.text, "see you at sunrise");

    assert!(engine.list_pending().await.unwrap().is_empty());
    assert_eq!(engine.list_public(10).await.unwrap().len(), 1);

    // highlighting again never re-queues a reviewed story
    engine.unhighlight("alice", "bob", message("m1")).await.unwrap();
    let again = engine.highlight("alice", "bob", message("m1")).await.unwrap();
    assert!(again.mutual);
    assert!(!again.established);
    assert_eq!(again.story_status, Some(StoryStatus::Approved));

    clock.set(ist(4, 0, 2));
    assert!(engine.list_public(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reject_is_allowed_while_locked() {
    let (engine, _) = setup(ist(2, 10, 0));
    engine.highlight("alice", "bob", message("m2")).await.unwrap();
    engine.highlight("bob", "alice", message("m2")).await.unwrap();

    let reviewed = engine
        .review("conv-ab~m2", Decision::Reject, "admin-1", Some("personal info".to_string()))
        .await
        .unwrap();
    assert_eq!(reviewed.story.status, StoryStatus::Rejected);
    assert!(reviewed.published.is_none());
    assert!(engine.list_public(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_end_to_end_two_day_streak() {
    let (engine, clock) = setup(ist(1, 20, 0));

    // day 1
    engine.favorite("alice", "bob").await.unwrap();
    let day1 = engine.favorite("bob", "alice").await.unwrap();
    assert_eq!(day1.streak_count, Some(1));
    assert_eq!(day1.lock_expires_at, Some(ist(2, 0, 0)));

    // day 2, after the reset
    clock.set(ist(2, 8, 0));
    engine.unfavorite("alice", "bob").await.unwrap();
    engine.unfavorite("bob", "alice").await.unwrap();
    assert!(!engine.favorite("alice", "bob").await.unwrap().mutual);
    let day2 = engine.favorite("bob", "alice").await.unwrap();

    assert_eq!(day2.streak_count, Some(2));
    assert_eq!(day2.lock_expires_at, Some(ist(3, 0, 0)));
    assert_eq!(engine.connections("alice").await.unwrap().len(), 1);
    assert_eq!(engine.connections("bob").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_connections_lists_every_pair() {
    let (engine, _) = setup(ist(2, 10, 0));
    for (a, b) in [("alice", "bob"), ("carol", "alice")] {
        engine.favorite(a, b).await.unwrap();
        engine.favorite(b, a).await.unwrap();
    }

    let ids: Vec<String> = engine
        .connections("alice")
        .await
        .unwrap()
        .iter()
        .map(|c| c.meta.id().to_string())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"alice~bob".to_string()));
    assert!(ids.contains(&"alice~carol".to_string()));
    assert_eq!(engine.connections("bob").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_notification_is_posted_after_commit() {
    let (notifier, mut rx) = ChannelNotifier::new();
    let (engine, _) = setup(ist(2, 10, 0));
    let engine = engine.with_notifier(notifier);

    engine.favorite("alice", "bob").await.unwrap();
    engine.favorite("bob", "alice").await.unwrap();

    let posted = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(posted.conversation_key, "alice~bob");
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_apply() {
    let (notifier, rx) = ChannelNotifier::new();
    drop(rx);
    let (engine, _) = setup(ist(2, 10, 0));
    let engine = engine.with_notifier(notifier);

    engine.favorite("alice", "bob").await.unwrap();
    let outcome = engine.favorite("bob", "alice").await.unwrap();
    assert!(outcome.established);
}

#[tokio::test]
async fn test_disabled_notifications() {
    let (notifier, mut rx) = ChannelNotifier::new();
    let (engine, _) = setup(ist(2, 10, 0));
    let engine = engine
        .with_notifier(notifier)
        .with_config(Config::default().with_notifications(false))
        .unwrap();

    engine.favorite("alice", "bob").await.unwrap();
    engine.favorite("bob", "alice").await.unwrap();
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_invalid_offset_is_rejected() {
    let (engine, _) = setup(ist(2, 10, 0));
    let result = engine.with_config(Config::default().with_utc_offset(25 * 3600));
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn test_invalid_public_window_is_rejected() {
    for hours in [-5, 0, i64::MAX] {
        let (engine, _) = setup(ist(2, 10, 0));
        let result = engine.with_config(Config::default().with_public_window_hours(hours));
        assert!(matches!(result, Err(Error::InvalidArgument(_))), "{} hours", hours);
    }

    let (engine, _) = setup(ist(2, 10, 0));
    let engine = engine
        .with_config(Config::default().with_public_window_hours(48))
        .unwrap();
    assert_eq!(engine.config().public_window_hours, 48);
}

#[tokio::test]
async fn test_status_watch_follows_changes_and_lock_expiry() {
    let (engine, clock) = setup(ist(2, 10, 0));
    let mut watch = engine
        .subscribe("alice", Target::favorite("bob"))
        .await
        .unwrap();

    let initial = watch.current();
    assert!(!initial.by_me && !initial.by_other && !initial.is_mutual);

    engine.favorite("alice", "bob").await.unwrap();
    let mine = tokio::time::timeout(Duration::from_secs(5), watch.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(mine.by_me);
    assert!(!mine.is_mutual);

    engine.favorite("bob", "alice").await.unwrap();
    let mutual = tokio::time::timeout(Duration::from_secs(5), watch.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(mutual.is_mutual);
    assert!(mutual.is_locked);
    assert_eq!(mutual.lock_expires_at, Some(ist(3, 0, 0)));
    assert_eq!(mutual.streak_count, Some(1));

    clock.set(ist(3, 0, 1));
    watch.refresh();
    let unlocked = tokio::time::timeout(Duration::from_secs(5), watch.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(unlocked.is_mutual);
    assert!(!unlocked.is_locked);

    assert_eq!(
        engine.status("bob", Target::favorite("alice")).await.unwrap(),
        kindred::StatusSnapshot {
            kind: LedgerKind::Favorite,
            by_me: true,
            by_other: true,
            is_mutual: true,
            is_locked: false,
            lock_expires_at: None,
            streak_count: Some(1),
            story_status: None,
        }
    );
}

#[tokio::test]
async fn test_apply_with_explicit_intent() {
    let (engine, _) = setup(ist(2, 10, 0));
    let added = engine
        .apply("alice", Target::favorite("bob"), Intent::Add)
        .await
        .unwrap();
    assert_eq!(added.intent, Intent::Add);
    assert_eq!(added.kind, LedgerKind::Favorite);

    let removed = engine
        .apply("alice", Target::favorite("bob"), Intent::Remove)
        .await
        .unwrap();
    assert_eq!(removed.intent, Intent::Remove);
    assert!(engine.favorites("alice").await.unwrap().is_empty());
}
