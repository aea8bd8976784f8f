use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    adapters::{Adapter, DocKey, ObjectRecord},
    config::Config,
    engine::{Transaction, run_atomic},
    error::Error,
    lock::LockPolicy,
    object::{ApprovedStory, Object, QueuedStory, StoryStatus, validate_key},
    query::Query,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub story: QueuedStory,
    /// Set when the story was approved.
    pub published: Option<ApprovedStory>,
}

/// Admin review of queued stories.
///
/// `pending -> approved` is blocked while the story's lock is active and
/// publishes an anonymized copy; `pending -> rejected` is always allowed.
/// Both are terminal.
#[derive(Clone)]
pub struct ReviewWorkflow {
    adapter: Arc<dyn Adapter>,
    policy: LockPolicy,
    config: Config,
}

impl ReviewWorkflow {
    pub fn new(adapter: Arc<dyn Adapter>, policy: LockPolicy, config: Config) -> Self {
        Self {
            adapter,
            policy,
            config,
        }
    }

    pub async fn review(
        &self,
        story_id: &str,
        decision: Decision,
        admin_id: &str,
        reason: Option<String>,
    ) -> Result<ReviewOutcome, Error> {
        let result = self.review_inner(story_id, decision, admin_id, reason).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };
        counter!("kindred.review.total", "decision" => decision.as_str(), "status" => status)
            .increment(1);

        if let Ok(outcome) = &result {
            info!(
                story = %story_id,
                admin = %admin_id,
                status = outcome.story.status.as_str(),
                "story reviewed"
            );
        }
        result
    }

    async fn review_inner(
        &self,
        story_id: &str,
        decision: Decision,
        admin_id: &str,
        reason: Option<String>,
    ) -> Result<ReviewOutcome, Error> {
        if story_id.trim().is_empty() {
            return Err(Error::invalid("story id must not be empty"));
        }
        validate_key("admin id", admin_id)?;

        let keys = [
            DocKey::object::<QueuedStory>(story_id),
            DocKey::object::<ApprovedStory>(story_id),
        ];

        run_atomic(
            self.adapter.as_ref(),
            &keys,
            self.config.max_conflict_retries,
            |tx| self.plan(tx, story_id, decision, admin_id, reason.clone()),
        )
        .await
    }

    fn plan(
        &self,
        tx: &mut Transaction<'_>,
        story_id: &str,
        decision: Decision,
        admin_id: &str,
        reason: Option<String>,
    ) -> Result<ReviewOutcome, Error> {
        let now = self.policy.clock().now();
        let mut story = tx
            .snapshot()
            .object::<QueuedStory>(story_id)?
            .ok_or(Error::NotFound)?;

        if !story.is_pending() {
            return Err(Error::invalid(format!(
                "story {} was already {}",
                story_id,
                story.status.as_str()
            )));
        }

        match decision {
            Decision::Approve => {
                if LockPolicy::is_locked_at(&story, now) {
                    return Err(Error::Locked {
                        until: story.lock_expires_at.unwrap_or(now),
                    });
                }
                story.mark_reviewed(StoryStatus::Approved, admin_id, None, now);
                let approved =
                    ApprovedStory::from_queued(&story, now, self.config.public_window()?)?;
                tx.put_object(&story)?;
                tx.put_object(&approved)?;
                Ok(ReviewOutcome {
                    story,
                    published: Some(approved),
                })
            }
            Decision::Reject => {
                story.mark_reviewed(StoryStatus::Rejected, admin_id, reason, now);
                tx.put_object(&story)?;
                Ok(ReviewOutcome {
                    story,
                    published: None,
                })
            }
        }
    }

    /// Stories awaiting review, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<QueuedStory>, Error> {
        self.adapter
            .query_objects(
                QueuedStory::TYPE,
                Query::new()
                    .where_eq("status", StoryStatus::Pending.as_str())
                    .sort_asc("queued_at"),
            )
            .await?
            .into_iter()
            .map(ObjectRecord::to_object)
            .collect()
    }

    /// Approved stories still inside their public window, newest first.
    pub async fn list_public(&self, limit: u32) -> Result<Vec<ApprovedStory>, Error> {
        let now = self.policy.clock().now();
        self.adapter
            .query_objects(
                ApprovedStory::TYPE,
                Query::new()
                    .where_gt("expires_at", now)
                    .sort_desc("approved_at")
                    .limit(limit),
            )
            .await?
            .into_iter()
            .map(ObjectRecord::to_object)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::{
        adapters::{MemoryAdapter, Record, Write},
        clock::{DayClock, ManualClock},
        object::MessageSnapshot,
    };

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, h, 0, 0).unwrap()
    }

    async fn setup(now: DateTime<Utc>) -> (ReviewWorkflow, Arc<ManualClock>, Arc<MemoryAdapter>) {
        setup_with(now, Config::default()).await
    }

    async fn setup_with(
        now: DateTime<Utc>,
        config: Config,
    ) -> (ReviewWorkflow, Arc<ManualClock>, Arc<MemoryAdapter>) {
        let adapter = Arc::new(MemoryAdapter::new());
        let clock = Arc::new(ManualClock::new(now));
        let policy = LockPolicy::new(DayClock::new(clock.clone(), Config::default().offset().unwrap()));
        let workflow = ReviewWorkflow::new(adapter.clone(), policy, config);

        let message = MessageSnapshot::new("c1", "m1", "alice", "hello", at(0));
        let story = QueuedStory::queue("alice", "bob", message, at(1), at(12));
        let key = DocKey::object::<QueuedStory>("c1~m1");
        adapter
            .commit(
                &[(key, 0)],
                vec![Write::Put(Record::Object(ObjectRecord::from_object(&story).unwrap()))],
            )
            .await
            .unwrap();

        (workflow, clock, adapter)
    }

    #[tokio::test]
    async fn test_approve_waits_for_lock() {
        let (workflow, clock, _) = setup(at(10)).await;

        let early = workflow.review("c1~m1", Decision::Approve, "admin", None).await;
        assert_eq!(early, Err(Error::Locked { until: at(12) }));

        clock.set(at(13));
        let outcome = workflow
            .review("c1~m1", Decision::Approve, "admin", None)
            .await
            .unwrap();
        let published = outcome.published.unwrap();
        assert_eq!(published.approved_at, at(13));
        assert_eq!(published.expires_at, at(13) + chrono::Duration::hours(24));
        assert_eq!(outcome.story.status, StoryStatus::Approved);
        assert_eq!(outcome.story.reviewed_by.as_deref(), Some("admin"));

        assert!(workflow.list_pending().await.unwrap().is_empty());
        assert_eq!(workflow.list_public(10).await.unwrap().len(), 1);

        clock.set(at(13) + chrono::Duration::hours(25));
        assert!(workflow.list_public(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_ignores_lock_and_is_terminal() {
        let (workflow, _, _) = setup(at(10)).await;
        assert_eq!(workflow.list_pending().await.unwrap().len(), 1);

        let outcome = workflow
            .review("c1~m1", Decision::Reject, "admin", Some("spam".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome.story.status, StoryStatus::Rejected);
        assert_eq!(outcome.story.rejection_reason.as_deref(), Some("spam"));
        assert!(outcome.published.is_none());

        let again = workflow.review("c1~m1", Decision::Approve, "admin", None).await;
        assert!(matches!(again, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_unknown_story() {
        let (workflow, _, _) = setup(at(10)).await;
        let result = workflow.review("c9~m9", Decision::Reject, "admin", None).await;
        assert_eq!(result, Err(Error::NotFound));
    }

    #[tokio::test]
    async fn test_bad_public_window_fails_without_publishing() {
        for hours in [-5, i64::MAX] {
            let config = Config::default().with_public_window_hours(hours);
            let (workflow, _, _) = setup_with(at(13), config).await;

            let result = workflow.review("c1~m1", Decision::Approve, "admin", None).await;
            assert!(matches!(result, Err(Error::InvalidArgument(_))), "{} hours", hours);
            assert_eq!(workflow.list_pending().await.unwrap().len(), 1);
        }
    }
}
