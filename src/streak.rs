use crate::clock::DayKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakStep {
    /// Already confirmed today.
    Unchanged,
    /// Confirmed yesterday, extended by one.
    Continue,
    /// A day or more was skipped, or there is no history.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreakUpdate {
    pub step: StreakStep,
    pub count: u32,
    pub date_to_store: DayKey,
}

/// Consecutive-day counter. Pure, no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreakCalculator;

impl StreakCalculator {
    pub fn next(last: Option<DayKey>, today: DayKey, current: u32) -> StreakUpdate {
        let step = match last {
            Some(last) if last == today => StreakStep::Unchanged,
            Some(last) if Some(last) == today.yesterday() => StreakStep::Continue,
            _ => StreakStep::Reset,
        };

        let count = match step {
            // a stored count of 0 is never valid; treat it as a fresh streak
            StreakStep::Unchanged => current.max(1),
            StreakStep::Continue => current.saturating_add(1).max(1),
            StreakStep::Reset => 1,
        };

        StreakUpdate {
            step,
            count,
            date_to_store: today,
        }
    }
}
