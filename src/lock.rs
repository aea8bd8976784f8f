use chrono::{DateTime, Utc};

use crate::clock::DayClock;

/// A shared entity that carries a day-boundary lock.
///
/// The stored flag is only a hint written at transition time; whether the
/// entity is locked right now is decided by [`LockPolicy::is_locked`].
pub trait Lockable {
    fn lock_flag(&self) -> bool;
    fn lock_expires_at(&self) -> Option<DateTime<Utc>>;
}

#[derive(Clone)]
pub struct LockPolicy {
    clock: DayClock,
}

impl LockPolicy {
    pub fn new(clock: DayClock) -> Self {
        Self { clock }
    }

    pub fn is_locked<L: Lockable + ?Sized>(&self, entity: &L) -> bool {
        Self::is_locked_at(entity, self.clock.now())
    }

    pub fn is_locked_at<L: Lockable + ?Sized>(entity: &L, now: DateTime<Utc>) -> bool {
        entity.lock_flag() && entity.lock_expires_at().is_some_and(|expiry| expiry > now)
    }

    /// Locks always run to the next day boundary, never a rolling window.
    pub fn new_lock_expiry(&self) -> DateTime<Utc> {
        self.clock.boundary_of_next_day()
    }

    /// Expiry of a lock created or renewed at `now`.
    pub fn lock_expiry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.clock.boundary_after(now)
    }

    pub fn clock(&self) -> &DayClock {
        &self.clock
    }

    /// Expiry of a currently active lock.
    pub fn active_expiry<L: Lockable + ?Sized>(&self, entity: &L) -> Option<DateTime<Utc>> {
        Self::active_expiry_at(entity, self.clock.now())
    }

    pub fn active_expiry_at<L: Lockable + ?Sized>(
        entity: &L,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if Self::is_locked_at(entity, now) {
            entity.lock_expires_at()
        } else {
            None
        }
    }
}
