//! Runs the burn-down engine over an interval.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use super::burndown::burn_down_grants;
use super::history::{GrantBurnDownHistory, GrantBurnDownHistorySegment, SegmentTerminationReasons};
use super::phases::plan_phases;
use super::reset::{ResetBehavior, reset_snapshot};
use super::{EngineError, EngineResult};
use crate::grant::{Grant, prioritize_grants};
use crate::snapshot::Snapshot;
use crate::timeutil::{ClosedPeriod, PeriodError, Timeline};
use crate::usage::UsageQuerier;

#[derive(Debug, Clone)]
pub struct RunParams {
    /// Every grant relevant between the snapshot and `until`.
    pub grants: Vec<Grant>,
    pub starting_snapshot: Snapshot,
    pub until: DateTime<Utc>,
    pub reset_behavior: ResetBehavior,
    /// Usage period resets; those in `(starting_snapshot.at, until]` apply.
    pub resets: Timeline,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    /// State at `until`.
    pub snapshot: Snapshot,
    pub history: GrantBurnDownHistory,
}

/// Burn-down engine. Holds no state between runs.
#[derive(Clone)]
pub struct Engine {
    querier: Arc<dyn UsageQuerier>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(querier: Arc<dyn UsageQuerier>) -> Self {
        Self { querier }
    }

    pub async fn run(&self, params: RunParams) -> EngineResult<RunResult> {
        let RunParams {
            grants,
            starting_snapshot,
            until,
            reset_behavior,
            resets,
        } = params;

        if !starting_snapshot.balances.exactly_for_grants(&grants) {
            return Err(EngineError::InconsistentInput {
                message: format!(
                    "starting balances cover {} grants, {} grants were provided",
                    starting_snapshot.balances.len(),
                    grants.len()
                ),
            });
        }

        let start = starting_snapshot.at;
        if until < start {
            return Err(PeriodError::Inverted {
                from: start,
                to: until,
            }
            .into());
        }

        let resets: Vec<DateTime<Utc>> = resets
            .iter()
            .filter(|t| start < *t && *t <= until)
            .collect();

        let usage_at_start = starting_snapshot.usage;
        let mut current = starting_snapshot;
        let mut segments: Vec<GrantBurnDownHistorySegment> = Vec::new();

        let mut from = start;
        for reset_at in resets.iter().copied() {
            let (ending, burnt) =
                self.burn_period(&grants, current, ClosedPeriod { from, to: reset_at }).await?;
            segments.extend(burnt);
            if let Some(last) = segments.last_mut() {
                last.termination_reasons.usage_reset = true;
            }

            let mut next = reset_snapshot(&grants, &ending, reset_behavior, reset_at)?;
            for grant in &grants {
                if !next.balances.contains(&grant.id) {
                    next.balances.set(grant.id.clone(), Decimal::ZERO);
                }
            }
            current = next;
            from = reset_at;
        }

        let (mut ending, burnt) = self
            .burn_period(&grants, current, ClosedPeriod { from, to: until })
            .await?;
        segments.extend(burnt);

        let history = GrantBurnDownHistory::new(segments, usage_at_start)?;
        if !history.is_empty() {
            ending.usage = history.usage_in_period_until_segment(history.len())?;
        }

        debug!(
            from = %start,
            until = %until,
            resets = resets.len(),
            segments = history.len(),
            balance = %ending.balance(),
            overage = %ending.overage,
            "Burn-down run finished"
        );

        Ok(RunResult {
            snapshot: ending,
            history,
        })
    }

    /// Burns a reset-free period, returning the ending state and one segment
    /// per phase.
    ///
    /// Balances of grants effective at `period.from` come from `starting`.
    async fn burn_period(
        &self,
        grants: &[Grant],
        starting: Snapshot,
        period: ClosedPeriod,
    ) -> EngineResult<(Snapshot, Vec<GrantBurnDownHistorySegment>)> {
        let phases = plan_phases(grants, period)?;
        let mut balances = starting.balances;
        let mut overage = starting.overage;
        let mut segments = Vec::with_capacity(phases.len());

        let mut prioritized: Vec<Grant> = Vec::new();
        let mut reprioritize = true;

        for phase in phases {
            if reprioritize {
                prioritized = grants
                    .iter()
                    .filter(|g| g.active_at(phase.from))
                    .cloned()
                    .collect();
                prioritize_grants(&mut prioritized);
            }
            reprioritize = phase.priority_change;

            let usage = self
                .querier
                .query_usage(phase.from, phase.to)
                .await
                .map_err(|source| EngineError::Usage {
                    from: phase.from,
                    to: phase.to,
                    source,
                })?;

            let outcome = burn_down_grants(&balances, &prioritized, usage + overage)?;

            segments.push(GrantBurnDownHistorySegment {
                period: phase.period(),
                balance_at_start: balances,
                overage_at_start: overage,
                overage: outcome.overage,
                total_usage: usage,
                grant_usages: outcome.usages,
                termination_reasons: SegmentTerminationReasons {
                    priority_change: phase.priority_change,
                    recurrence: phase.grants_recurred_at_end.clone(),
                    usage_reset: false,
                },
            });

            balances = outcome.balances;
            overage = outcome.overage;

            for grant in prioritized.iter().filter(|g| !g.active_at(phase.to)) {
                balances.set(grant.id.clone(), Decimal::ZERO);
            }

            for id in &phase.grants_recurred_at_end {
                let grant = grants
                    .iter()
                    .find(|g| &g.id == id)
                    .ok_or_else(|| EngineError::UnknownGrant { id: id.to_string() })?;
                let current = balances.get(id).unwrap_or(Decimal::ZERO);
                balances.set(id.clone(), grant.recurrence_balance(current));
            }

            // Grants starting at the boundary enter the next phase at full amount.
            for grant in grants
                .iter()
                .filter(|g| g.effective_at == phase.to && g.active_at(phase.to))
            {
                balances.set(grant.id.clone(), grant.amount);
            }
        }

        Ok((
            Snapshot {
                balances,
                overage,
                usage: starting.usage,
                at: period.to,
            },
            segments,
        ))
    }
}
