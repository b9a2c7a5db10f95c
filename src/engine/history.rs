//! Segmented burn-down history.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::burndown::GrantUsage;
use super::{EngineError, EngineResult};
use crate::grant::{BalanceMap, GrantId};
use crate::snapshot::{Snapshot, SnapshottedUsage};
use crate::timeutil::ClosedPeriod;

/// Why a segment ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentTerminationReasons {
    pub priority_change: bool,
    /// Grants replenished at the end of the segment.
    pub recurrence: Vec<GrantId>,
    pub usage_reset: bool,
}

/// Outcome of one burn phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantBurnDownHistorySegment {
    pub period: ClosedPeriod,
    pub balance_at_start: BalanceMap,
    pub overage_at_start: Decimal,
    pub overage: Decimal,
    /// Usage metered during the segment, excluding carried overage.
    pub total_usage: Decimal,
    pub grant_usages: Vec<GrantUsage>,
    pub termination_reasons: SegmentTerminationReasons,
}

impl GrantBurnDownHistorySegment {
    /// Balances at the end of the segment, before recurrences or resets.
    pub fn balance_at_end(&self) -> BalanceMap {
        let mut balances = self.balance_at_start.clone();
        for usage in &self.grant_usages {
            balances.burn(&usage.grant_id, usage.usage);
        }
        balances
    }
}

/// Ordered, non-overlapping segments plus the usage accumulated before the
/// first one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantBurnDownHistory {
    segments: Vec<GrantBurnDownHistorySegment>,
    usage_at_start: SnapshottedUsage,
}

impl GrantBurnDownHistory {
    pub fn new(
        segments: Vec<GrantBurnDownHistorySegment>,
        usage_at_start: SnapshottedUsage,
    ) -> EngineResult<Self> {
        for (index, pair) in segments.windows(2).enumerate() {
            if pair[1].period.from < pair[0].period.to {
                return Err(EngineError::OverlappingSegments {
                    index: index + 1,
                    previous: pair[0].period,
                    next: pair[1].period,
                });
            }
        }

        Ok(Self {
            segments,
            usage_at_start,
        })
    }

    pub fn segments(&self) -> &[GrantBurnDownHistorySegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn usage_at_start(&self) -> SnapshottedUsage {
        self.usage_at_start
    }

    pub fn total_usage(&self) -> Decimal {
        self.segments.iter().map(|s| s.total_usage).sum()
    }

    pub fn into_segments(self) -> Vec<GrantBurnDownHistorySegment> {
        self.segments
    }

    pub fn snapshot_at_start_of_segment(&self, index: usize) -> EngineResult<Snapshot> {
        let segment = self
            .segments
            .get(index)
            .ok_or(EngineError::SegmentIndexOutOfRange {
                index,
                len: self.segments.len(),
            })?;

        Ok(Snapshot {
            balances: segment.balance_at_start.clone(),
            overage: segment.overage_at_start,
            usage: self.usage_in_period_until_segment(index)?,
            at: segment.period.from,
        })
    }

    /// Usage accumulated in the current usage period before segment `index`.
    /// `index == len()` gives the usage at the end of the history.
    pub fn usage_in_period_until_segment(&self, index: usize) -> EngineResult<SnapshottedUsage> {
        if index > self.segments.len() {
            return Err(EngineError::SegmentIndexOutOfRange {
                index,
                len: self.segments.len(),
            });
        }

        let before = &self.segments[..index];
        match before
            .iter()
            .rposition(|s| s.termination_reasons.usage_reset)
        {
            Some(reset) => Ok(SnapshottedUsage {
                since: before[reset].period.to,
                usage: before[reset + 1..].iter().map(|s| s.total_usage).sum(),
            }),
            None => Ok(SnapshottedUsage {
                since: self.usage_at_start.since,
                usage: self.usage_at_start.usage
                    + before.iter().map(|s| s.total_usage).sum::<Decimal>(),
            }),
        }
    }
}
