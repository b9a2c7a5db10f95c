//! Splits a period into burn phases with a stable active grant set.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::EngineResult;
use crate::grant::{Grant, GrantId};
use crate::timeutil::{ClosedPeriod, truncate_to_minute};

/// A sub-interval within which the active, prioritized grant set is stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnPhase {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Grants whose balance is replenished at `to`.
    pub grants_recurred_at_end: Vec<GrantId>,
    /// The active grant set changes at `to`.
    pub priority_change: bool,
}

impl BurnPhase {
    pub fn period(&self) -> ClosedPeriod {
        ClosedPeriod {
            from: self.from,
            to: self.to,
        }
    }
}

/// Plans the burn phases covering `period`, which must not contain a usage
/// reset.
///
/// Recurrences falling exactly on `period.to` are attached to the last phase
/// so they are applied before the ending balance is reported.
pub fn plan_phases(grants: &[Grant], period: ClosedPeriod) -> EngineResult<Vec<BurnPhase>> {
    if period.is_empty() {
        return Ok(Vec::new());
    }

    let activity = activity_changes(grants, period);
    let (recurrences, recurred_at_end) = recurrence_times(grants, period)?;

    let mut phases = Vec::with_capacity(activity.len() + recurrences.len() + 1);
    let mut from = period.from;
    let (mut a, mut r) = (0, 0);

    loop {
        let next_activity = activity.get(a).copied();
        let next_recurrence = recurrences.get(r).map(|(t, _)| *t);

        let (to, priority_change, recurred) = match (next_activity, next_recurrence) {
            (None, None) => break,
            (Some(at), None) => {
                a += 1;
                (at, true, Vec::new())
            }
            (None, Some(rt)) => {
                r += 1;
                (rt, false, recurrences[r - 1].1.clone())
            }
            (Some(at), Some(rt)) if at < rt => {
                a += 1;
                (at, true, Vec::new())
            }
            (Some(at), Some(rt)) if rt < at => {
                r += 1;
                (rt, false, recurrences[r - 1].1.clone())
            }
            (Some(at), Some(_)) => {
                a += 1;
                r += 1;
                (at, true, recurrences[r - 1].1.clone())
            }
        };

        if to > from {
            phases.push(BurnPhase {
                from,
                to,
                grants_recurred_at_end: recurred,
                priority_change,
            });
            from = to;
        }
    }

    phases.push(BurnPhase {
        from,
        to: period.to,
        grants_recurred_at_end: recurred_at_end,
        priority_change: false,
    });

    debug!(
        period = %period,
        phases = phases.len(),
        activity_changes = activity.len(),
        recurrences = recurrences.len(),
        "Planned burn phases"
    );

    Ok(phases)
}

/// Instants strictly inside `period` where a grant starts or stops being
/// active, truncated to the minute.
fn activity_changes(grants: &[Grant], period: ClosedPeriod) -> Vec<DateTime<Utc>> {
    let mut changes: Vec<DateTime<Utc>> = grants
        .iter()
        .flat_map(|grant| {
            let effective = grant.effective_period();
            match effective.to {
                // Never active, so it never changes the active set.
                Some(end) if end <= grant.effective_at => vec![],
                Some(end) => vec![grant.effective_at, end],
                None => vec![grant.effective_at],
            }
        })
        .map(truncate_to_minute)
        .filter(|t| period.contains_strictly(*t))
        .collect();

    changes.sort();
    changes.dedup();
    changes
}

type RecurrenceTimes = Vec<(DateTime<Utc>, Vec<GrantId>)>;

/// Recurrence instants strictly inside `period`, grouped by instant, plus
/// the grants recurring exactly at `period.to`.
fn recurrence_times(
    grants: &[Grant],
    period: ClosedPeriod,
) -> EngineResult<(RecurrenceTimes, Vec<GrantId>)> {
    let mut times: Vec<(DateTime<Utc>, GrantId)> = Vec::new();
    let mut at_end = Vec::new();

    for grant in grants {
        let Some(recurrence) = grant.recurrence else {
            continue;
        };

        let mut t = recurrence.next_after(grant.effective_at.max(period.from))?;
        while t <= period.to && grant.active_at(t) {
            if t == period.to {
                at_end.push(grant.id.clone());
                break;
            }
            times.push((t, grant.id.clone()));
            t = recurrence.next_after(t)?;
        }
    }

    times.sort_by_key(|(t, _)| *t);

    let mut grouped: RecurrenceTimes = Vec::new();
    for (t, id) in times {
        match grouped.last_mut() {
            Some((last, ids)) if *last == t => ids.push(id),
            _ => grouped.push((t, vec![id])),
        }
    }

    Ok((grouped, at_end))
}
