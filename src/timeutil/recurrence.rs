use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use super::PeriodError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurrenceInterval {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl RecurrenceInterval {
    fn fixed(&self) -> Option<Duration> {
        match self {
            Self::Hour => Some(Duration::hours(1)),
            Self::Day => Some(Duration::days(1)),
            Self::Week => Some(Duration::weeks(1)),
            Self::Month | Self::Year => None,
        }
    }

    fn months(&self) -> u32 {
        match self {
            Self::Year => 12,
            _ => 1,
        }
    }
}

/// Periodic instants aligned to `anchor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recurrence {
    pub interval: RecurrenceInterval,
    pub anchor: DateTime<Utc>,
}

impl Recurrence {
    pub fn new(interval: RecurrenceInterval, anchor: DateTime<Utc>) -> Self {
        Self { interval, anchor }
    }

    /// The `n`-th iteration counted from the anchor; calendar intervals are
    /// always computed from the anchor so month-end days don't drift.
    pub fn iteration(&self, n: i64) -> Result<DateTime<Utc>, PeriodError> {
        let overflow = || PeriodError::RecurrenceOverflow {
            anchor: self.anchor,
        };

        if let Some(step) = self.interval.fixed() {
            let offset = step
                .checked_mul(i32::try_from(n).map_err(|_| overflow())?)
                .ok_or_else(overflow)?;
            return self.anchor.checked_add_signed(offset).ok_or_else(overflow);
        }

        let months = n
            .checked_mul(i64::from(self.interval.months()))
            .ok_or_else(overflow)?;
        let magnitude = Months::new(u32::try_from(months.unsigned_abs()).map_err(|_| overflow())?);
        if months >= 0 {
            self.anchor.checked_add_months(magnitude)
        } else {
            self.anchor.checked_sub_months(magnitude)
        }
        .ok_or_else(overflow)
    }

    /// Index of the latest iteration at or before `t`.
    fn index_at_or_before(&self, t: DateTime<Utc>) -> Result<i64, PeriodError> {
        let mut n = match self.interval.fixed() {
            Some(step) => (t - self.anchor).num_seconds().div_euclid(step.num_seconds()),
            None => month_distance(self.anchor, t).div_euclid(i64::from(self.interval.months())),
        };

        while self.iteration(n)? > t {
            n -= 1;
        }
        while self.iteration(n + 1)? <= t {
            n += 1;
        }
        Ok(n)
    }

    /// The first iteration strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>, PeriodError> {
        let n = self.index_at_or_before(t)?;
        self.iteration(n + 1)
    }

    /// The latest iteration at or before `t`.
    pub fn prev_before_or_at(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>, PeriodError> {
        let n = self.index_at_or_before(t)?;
        self.iteration(n)
    }
}

/// Whole calendar months from `a` to `b`, ignoring the day of month.
fn month_distance(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    (i64::from(b.year()) - i64::from(a.year())) * 12 + i64::from(b.month()) - i64::from(a.month())
}
