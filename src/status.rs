use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Notify, broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    adapters::{Adapter, DocKey, Record, Snapshot},
    clock::DayClock,
    edge::LedgerKind,
    engine::Resolved,
    error::Error,
    lock::LockPolicy,
    object::{Connection, QueuedStory, StoryStatus},
};

/// Denormalized view of one actor/target pair for presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub kind: LedgerKind,
    pub by_me: bool,
    pub by_other: bool,
    pub is_mutual: bool,
    /// Recomputed against the clock, never the stored flag alone.
    pub is_locked: bool,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub streak_count: Option<u32>,
    pub story_status: Option<StoryStatus>,
}

impl StatusSnapshot {
    /// Fold the three documents of a pair into one status.
    pub(crate) fn fold(
        resolved: &Resolved,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Result<Self, Error> {
        let by_me = points_at(
            snapshot.get(&resolved.actor_entry_key()),
            &resolved.counterpart_id,
        )?;
        let by_other = points_at(
            snapshot.get(&resolved.counterpart_entry_key()),
            &resolved.actor_id,
        )?;

        let mut status = Self {
            kind: resolved.kind(),
            by_me,
            by_other,
            is_mutual: by_me && by_other,
            is_locked: false,
            lock_expires_at: None,
            streak_count: None,
            story_status: None,
        };

        let shared_id = resolved.shared_id();
        match resolved.kind() {
            LedgerKind::Favorite => {
                if let Some(conn) = snapshot.object::<Connection>(&shared_id)? {
                    status.lock_expires_at = LockPolicy::active_expiry_at(&conn, now);
                    status.streak_count = Some(conn.streak_count);
                }
            }
            LedgerKind::Highlight => {
                if let Some(story) = snapshot.object::<QueuedStory>(&shared_id)? {
                    status.lock_expires_at = LockPolicy::active_expiry_at(&story, now);
                    status.story_status = Some(story.status);
                }
            }
        }
        status.is_locked = status.lock_expires_at.is_some();

        Ok(status)
    }
}

/// Whether `record` is a ledger entry naming `counterpart` on its other end.
fn points_at(record: Option<&Record>, counterpart: &str) -> Result<bool, Error> {
    match record {
        Some(Record::Edge(record)) => Ok(record.clone().to_entry()?.counterpart_id == counterpart),
        Some(Record::Object(_)) => Err(Error::TypeMismatch),
        None => Ok(false),
    }
}

pub(crate) async fn project(
    adapter: &dyn Adapter,
    resolved: &Resolved,
    clock: &DayClock,
) -> Result<StatusSnapshot, Error> {
    let snapshot = adapter.read(&resolved.keys()).await?;
    StatusSnapshot::fold(resolved, &snapshot, clock.now())
}

/// Live status of one pair. Re-derived whenever one of its documents is
/// committed and when a displayed lock runs out. Dropping the watch stops
/// the background task.
pub struct StatusWatch {
    receiver: watch::Receiver<StatusSnapshot>,
    refresh: Arc<Notify>,
    task: JoinHandle<()>,
}

impl StatusWatch {
    pub(crate) async fn spawn(
        adapter: Arc<dyn Adapter>,
        clock: DayClock,
        resolved: Resolved,
    ) -> Result<Self, Error> {
        // subscribe first so a commit between the read and the loop is not lost
        let changes = adapter.subscribe();
        let initial = project(adapter.as_ref(), &resolved, &clock).await?;

        let (sender, receiver) = watch::channel(initial);
        let refresh = Arc::new(Notify::new());
        let projector = Projector {
            adapter,
            clock,
            keys: resolved.keys(),
            resolved,
            sender,
            refresh: refresh.clone(),
        };
        let task = tokio::spawn(projector.run(changes));

        Ok(Self {
            receiver,
            refresh,
            task,
        })
    }

    pub fn current(&self) -> StatusSnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next status that differs from the last one seen.
    pub async fn changed(&mut self) -> Result<StatusSnapshot, Error> {
        self.receiver
            .changed()
            .await
            .map_err(|_| Error::Unavailable("status projector stopped".to_string()))?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// Re-derive now, e.g. after the clock was moved.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }
}

impl Drop for StatusWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Projector {
    adapter: Arc<dyn Adapter>,
    clock: DayClock,
    resolved: Resolved,
    keys: [DocKey; 3],
    sender: watch::Sender<StatusSnapshot>,
    refresh: Arc<Notify>,
}

impl Projector {
    async fn run(self, mut changes: broadcast::Receiver<DocKey>) {
        loop {
            let expiry = self.sender.borrow().lock_expires_at;
            let wake = expiry.and_then(|at| self.clock.time_until(at).to_std().ok());

            let recompute = tokio::select! {
                change = changes.recv() => match change {
                    Ok(key) => self.keys.contains(&key),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "status feed lagged, re-deriving");
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = self.refresh.notified() => true,
                _ = sleep_until(wake) => true,
                _ = self.sender.closed() => return,
            };
            if !recompute {
                continue;
            }

            match project(self.adapter.as_ref(), &self.resolved, &self.clock).await {
                Ok(status) => {
                    self.sender.send_if_modified(|current| {
                        if *current == status {
                            false
                        } else {
                            *current = status;
                            true
                        }
                    });
                }
                Err(err) => warn!(error = %err, "status projection failed"),
            }
        }
    }
}

async fn sleep_until(wake: Option<std::time::Duration>) {
    match wake {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending().await,
    }
}
