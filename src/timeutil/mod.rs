//! Time periods, minute rounding, recurrences and timelines.

mod recurrence;

pub use recurrence::{Recurrence, RecurrenceInterval};

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Usage is attributed at minute granularity.
pub const USAGE_GRANULARITY: Duration = Duration::minutes(1);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeriodError {
    #[error("Invalid period: from {from} is after to {to}")]
    Inverted {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("Recurrence overflowed while iterating from {anchor}")]
    RecurrenceOverflow { anchor: DateTime<Utc> },
}

/// A bounded `[from, to)` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClosedPeriod {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ClosedPeriod {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, PeriodError> {
        if from > to {
            return Err(PeriodError::Inverted { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    pub fn duration(&self) -> Duration {
        self.to - self.from
    }

    /// Start-inclusive, end-exclusive containment.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.from <= t && t < self.to
    }

    pub fn contains_inclusive(&self, t: DateTime<Utc>) -> bool {
        self.from <= t && t <= self.to
    }

    /// Whether `t` lies strictly between the two ends.
    pub fn contains_strictly(&self, t: DateTime<Utc>) -> bool {
        self.from < t && t < self.to
    }

    pub fn overlaps(&self, other: &ClosedPeriod) -> bool {
        self.from < other.to && other.from < self.to
    }

    pub fn covers(&self, other: &ClosedPeriod) -> bool {
        self.from <= other.from && other.to <= self.to
    }
}

impl std::fmt::Display for ClosedPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}

/// A period whose ends may be unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenPeriod {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl OpenPeriod {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| from <= t) && self.to.is_none_or(|to| t < to)
    }

    pub fn overlaps(&self, period: &ClosedPeriod) -> bool {
        self.from.is_none_or(|from| from <= period.to)
            && self.to.is_none_or(|to| period.from < to)
    }
}

pub fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(USAGE_GRANULARITY).unwrap_or(t)
}

/// Rounds up to the next whole minute, keeping instants already on a minute.
pub fn ceil_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = truncate_to_minute(t);
    if truncated == t {
        t
    } else {
        truncated + USAGE_GRANULARITY
    }
}

/// Sorted, de-duplicated instants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    times: Vec<DateTime<Utc>>,
}

impl Timeline {
    pub fn new(times: impl IntoIterator<Item = DateTime<Utc>>) -> Self {
        let mut times: Vec<_> = times.into_iter().collect();
        times.sort();
        times.dedup();
        Self { times }
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn first(&self) -> Option<DateTime<Utc>> {
        self.times.first().copied()
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.times.last().copied()
    }

    /// Instants within `[period.from, period.to]`.
    pub fn between_inclusive(&self, period: &ClosedPeriod) -> Timeline {
        Self {
            times: self
                .times
                .iter()
                .copied()
                .filter(|t| period.contains_inclusive(*t))
                .collect(),
        }
    }

    /// Latest instant at or before `t`.
    pub fn latest_at_or_before(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let idx = self.times.partition_point(|x| *x <= t);
        idx.checked_sub(1).map(|i| self.times[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.times.iter().copied()
    }
}

impl FromIterator<DateTime<Utc>> for Timeline {
    fn from_iter<I: IntoIterator<Item = DateTime<Utc>>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_minute_rounding() {
        assert_eq!(truncate_to_minute(t(10, 5, 30)), t(10, 5, 0));
        assert_eq!(ceil_to_minute(t(10, 5, 30)), t(10, 6, 0));
        assert_eq!(ceil_to_minute(t(10, 5, 0)), t(10, 5, 0));
    }

    #[test]
    fn test_closed_period_rejects_inverted_bounds() {
        assert!(ClosedPeriod::new(t(11, 0, 0), t(10, 0, 0)).is_err());
        let period = ClosedPeriod::new(t(10, 0, 0), t(11, 0, 0)).unwrap();
        assert!(period.contains(t(10, 0, 0)));
        assert!(!period.contains(t(11, 0, 0)));
        assert!(period.contains_inclusive(t(11, 0, 0)));
        assert!(!period.contains_strictly(t(10, 0, 0)));
    }

    #[test]
    fn test_open_period_containment() {
        let period = OpenPeriod {
            from: Some(t(10, 0, 0)),
            to: None,
        };
        assert!(period.contains(t(23, 0, 0)));
        assert!(!period.contains(t(9, 59, 0)));
    }

    #[test]
    fn test_timeline_sorted_and_deduplicated() {
        let timeline = Timeline::new([t(12, 0, 0), t(10, 0, 0), t(12, 0, 0)]);
        assert_eq!(timeline.times(), &[t(10, 0, 0), t(12, 0, 0)]);
        assert_eq!(timeline.latest_at_or_before(t(11, 0, 0)), Some(t(10, 0, 0)));
        assert_eq!(timeline.latest_at_or_before(t(12, 0, 0)), Some(t(12, 0, 0)));
        assert_eq!(timeline.latest_at_or_before(t(9, 0, 0)), None);

        let window = ClosedPeriod::new(t(11, 0, 0), t(12, 0, 0)).unwrap();
        assert_eq!(timeline.between_inclusive(&window).times(), &[t(12, 0, 0)]);
    }
}
