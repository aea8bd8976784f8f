//! Day boundaries in one fixed timezone offset.
//!
//! Every lock expiry and streak comparison goes through [`DayClock`]; nothing
//! else in the crate converts an instant into a calendar day.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Days, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Wall-clock source.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Calendar date in the reset timezone, rendered as `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Result<Self, Error> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| Error::invalid(format!("no such date: {year}-{month}-{day}")))
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self)
            .map_err(|e| Error::invalid(format!("bad day key {s:?}: {e}")))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Previous calendar day. Date arithmetic, never `- 24h`.
    pub fn yesterday(&self) -> Option<DayKey> {
        self.0.checked_sub_days(Days::new(1)).map(Self)
    }

    pub fn tomorrow(&self) -> Option<DayKey> {
        self.0.checked_add_days(Days::new(1)).map(Self)
    }
}

impl Display for DayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for DayKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Clone)]
pub struct DayClock {
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl DayClock {
    pub fn new(clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        Self { clock, offset }
    }

    pub fn system(offset: FixedOffset) -> Self {
        Self::new(Arc::new(SystemClock), offset)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> DayKey {
        self.day_of(self.now())
    }

    pub fn day_of(&self, instant: DateTime<Utc>) -> DayKey {
        DayKey(instant.with_timezone(&self.offset).date_naive())
    }

    /// First instant of the day after `today()`.
    pub fn boundary_of_next_day(&self) -> DateTime<Utc> {
        self.boundary_after(self.now())
    }

    pub fn time_until_boundary(&self) -> chrono::Duration {
        self.boundary_of_next_day() - self.now()
    }

    /// Time left until `instant`, zero once it has passed.
    pub fn time_until(&self, instant: DateTime<Utc>) -> chrono::Duration {
        (instant - self.now()).max(chrono::Duration::zero())
    }

    /// First instant of the day after the one containing `instant`.
    pub fn boundary_after(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let local_midnight = self
            .day_of(instant)
            .0
            .checked_add_days(Days::new(1))
            .unwrap_or(NaiveDate::MAX)
            .and_time(chrono::NaiveTime::MIN);
        let utc = local_midnight - chrono::Duration::seconds(self.offset.local_minus_utc() as i64);
        Utc.from_utc_datetime(&utc)
    }
}
