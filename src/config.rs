use chrono::{FixedOffset, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Longest public window accepted, one leap year.
pub const MAX_PUBLIC_WINDOW_HOURS: i64 = 24 * 366;

/// Engine configuration.
///
/// The UTC offset is the single reset clock for the whole system: streak
/// comparisons and lock expiries are both evaluated in it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Fixed offset east of UTC, in seconds.
    pub utc_offset_seconds: i32,
    /// Extra attempts after a conflicted transaction before surfacing `Conflict`.
    pub max_conflict_retries: u32,
    /// Public visibility of an approved story, measured from approval.
    pub public_window_hours: i64,
    /// Post a chat notification when a shared entity is created or renewed.
    pub notifications: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            utc_offset_seconds: 5 * 3600 + 30 * 60,
            max_conflict_retries: 3,
            public_window_hours: 24,
            notifications: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `KINDRED_*` environment variables.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(v) = env_var("KINDRED_UTC_OFFSET_SECONDS") {
            config.utc_offset_seconds = parse_var("KINDRED_UTC_OFFSET_SECONDS", &v)?;
        }
        if let Some(v) = env_var("KINDRED_MAX_CONFLICT_RETRIES") {
            config.max_conflict_retries = parse_var("KINDRED_MAX_CONFLICT_RETRIES", &v)?;
        }
        if let Some(v) = env_var("KINDRED_PUBLIC_WINDOW_HOURS") {
            config.public_window_hours = parse_var("KINDRED_PUBLIC_WINDOW_HOURS", &v)?;
        }
        if let Some(v) = env_var("KINDRED_NOTIFICATIONS") {
            config.notifications = parse_var("KINDRED_NOTIFICATIONS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_utc_offset(mut self, seconds: i32) -> Self {
        self.utc_offset_seconds = seconds;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_public_window_hours(mut self, hours: i64) -> Self {
        self.public_window_hours = hours;
        self
    }

    pub fn with_notifications(mut self, enabled: bool) -> Self {
        self.notifications = enabled;
        self
    }

    /// Range checks shared by every way a config reaches the engine.
    pub fn validate(&self) -> Result<(), Error> {
        self.offset()?;
        self.public_window()?;
        Ok(())
    }

    pub fn offset(&self) -> Result<FixedOffset, Error> {
        FixedOffset::east_opt(self.utc_offset_seconds).ok_or_else(|| {
            Error::invalid(format!(
                "utc offset out of range: {}s",
                self.utc_offset_seconds
            ))
        })
    }

    pub fn public_window(&self) -> Result<TimeDelta, Error> {
        if self.public_window_hours <= 0 || self.public_window_hours > MAX_PUBLIC_WINDOW_HOURS {
            return Err(Error::invalid(format!(
                "public_window_hours must be within 1..={}, got {}",
                MAX_PUBLIC_WINDOW_HOURS, self.public_window_hours
            )));
        }
        TimeDelta::try_hours(self.public_window_hours).ok_or_else(|| {
            Error::invalid(format!(
                "public window out of range: {}h",
                self.public_window_hours
            ))
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid(format!("{} has an invalid value: {:?}", name, value)))
}
