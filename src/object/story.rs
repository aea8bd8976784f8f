use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    lock::Lockable,
    object::{Meta, Object, content_key, sorted_pair, validate_key},
    query::IndexMeta,
};

/// Copy of a chat message taken at highlight time.
///
/// Stories hold this copy, not a reference, so later edits or deletes of the
/// live message never reach the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageSnapshot {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl MessageSnapshot {
    pub fn new(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            sent_at,
        }
    }

    pub fn content_key(&self) -> String {
        content_key(&self.conversation_id, &self.message_id)
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_key("conversation id", &self.conversation_id)?;
        validate_key("message id", &self.message_id)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::Approved => "approved",
            StoryStatus::Rejected => "rejected",
        }
    }
}

/// Shared entity derived from mutual highlights, awaiting review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedStory {
    #[serde(rename = "_meta")]
    pub meta: Meta,
    pub participant_ids: [String; 2],
    pub content_snapshot: MessageSnapshot,
    pub queued_at: DateTime<Utc>,
    pub status: StoryStatus,
    pub locked: bool,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub rejection_reason: Option<String>,
}

impl QueuedStory {
    pub fn queue(
        a: &str,
        b: &str,
        content: MessageSnapshot,
        now: DateTime<Utc>,
        lock_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: Meta::new(content.content_key(), now),
            participant_ids: sorted_pair(a, b),
            content_snapshot: content,
            queued_at: now,
            status: StoryStatus::Pending,
            locked: true,
            lock_expires_at: Some(lock_expires_at),
            reviewed_at: None,
            reviewed_by: None,
            rejection_reason: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == StoryStatus::Pending
    }

    pub(crate) fn mark_reviewed(
        &mut self,
        status: StoryStatus,
        admin_id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.locked = false;
        self.reviewed_at = Some(now);
        self.reviewed_by = Some(admin_id.to_string());
        self.rejection_reason = reason;
        self.meta.updated_at = now;
    }
}

impl Lockable for QueuedStory {
    fn lock_flag(&self) -> bool {
        self.locked
    }

    fn lock_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock_expires_at
    }
}

impl Object for QueuedStory {
    const TYPE: &'static str = "QueuedStory";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_meta(&self) -> IndexMeta {
        IndexMeta::new()
            .with("status", self.status.as_str())
            .with("queued_at", self.queued_at)
            .with("conversation_id", self.content_snapshot.conversation_id.as_str())
    }
}

/// Anonymized public copy: no participant or sender ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicContent {
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl From<&MessageSnapshot> for PublicContent {
    fn from(snapshot: &MessageSnapshot) -> Self {
        Self {
            text: snapshot.text.clone(),
            sent_at: snapshot.sent_at,
        }
    }
}

/// Publicly visible story, read-only once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovedStory {
    #[serde(rename = "_meta")]
    pub meta: Meta,
    pub content: PublicContent,
    pub approved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ApprovedStory {
    /// Fails with [`Error::InvalidArgument`] when `now + window` is not
    /// representable or not after `now`.
    pub fn from_queued(
        story: &QueuedStory,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<Self, Error> {
        let expires_at = now
            .checked_add_signed(window)
            .filter(|at| *at > now)
            .ok_or_else(|| Error::invalid("public window does not yield a later expiry"))?;
        Ok(Self {
            meta: Meta::new(story.meta.id.clone(), now),
            content: PublicContent::from(&story.content_snapshot),
            approved_at: now,
            expires_at,
        })
    }

    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl Object for ApprovedStory {
    const TYPE: &'static str = "ApprovedStory";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_meta(&self) -> IndexMeta {
        IndexMeta::new()
            .with("approved_at", self.approved_at)
            .with("expires_at", self.expires_at)
    }
}
