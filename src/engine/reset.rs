//! Rolls an ending snapshot into a new usage period.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::burndown::burn_down_grants;
use super::{EngineError, EngineResult};
use crate::grant::{BalanceMap, Grant, prioritize_grants};
use crate::snapshot::{Snapshot, SnapshottedUsage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetBehavior {
    /// Carry overage into the new period instead of forgiving it.
    pub preserve_overage: bool,
}

/// Starting snapshot of the usage period beginning at `at`.
///
/// Grants inactive at `at` are dropped; the rest keep their rollover balance.
/// A grant becoming effective at `at` has no previous period and starts at
/// its full amount. Carried overage is burnt against these balances right
/// away.
pub fn reset_snapshot(
    grants: &[Grant],
    ending: &Snapshot,
    behavior: ResetBehavior,
    at: DateTime<Utc>,
) -> EngineResult<Snapshot> {
    let mut balances = BalanceMap::new();
    let mut active = Vec::new();

    for (id, balance) in &ending.balances {
        let grant = grants
            .iter()
            .find(|g| &g.id == id)
            .ok_or_else(|| EngineError::UnknownGrant { id: id.to_string() })?;
        if !grant.active_at(at) {
            continue;
        }
        let starting = if grant.effective_at >= at {
            grant.amount
        } else {
            grant.rollover_balance(*balance)
        };
        balances.set(id.clone(), starting);
        active.push(grant.clone());
    }

    let starting_overage = if behavior.preserve_overage {
        ending.overage
    } else {
        Decimal::ZERO
    };

    prioritize_grants(&mut active);
    let outcome = burn_down_grants(&balances, &active, starting_overage)?;

    Ok(Snapshot {
        balances: outcome.balances,
        overage: outcome.overage,
        usage: SnapshottedUsage::zero_since(at),
        at,
    })
}
