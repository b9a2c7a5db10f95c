//! Prioritized burn-down of usage against grant balances.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{EngineError, EngineResult};
use crate::grant::{BalanceMap, Grant, GrantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantUsageTerminationReason {
    /// The grant's balance was fully consumed.
    Exhausted,
    /// The segment ended before the balance ran out.
    SegmentTermination,
}

/// Usage attributed to one grant within a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantUsage {
    pub grant_id: GrantId,
    pub usage: Decimal,
    pub termination_reason: GrantUsageTerminationReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnDownOutcome {
    pub balances: BalanceMap,
    pub usages: Vec<GrantUsage>,
    /// Usage no grant could cover.
    pub overage: Decimal,
}

/// Burns `usage` from `prioritized_grants` in order. Grants without a
/// positive balance are skipped.
pub fn burn_down_grants(
    balances: &BalanceMap,
    prioritized_grants: &[Grant],
    usage: Decimal,
) -> EngineResult<BurnDownOutcome> {
    let mut balances = balances.clone();
    let mut usages = Vec::new();
    let mut remaining = usage;

    for grant in prioritized_grants {
        if remaining <= Decimal::ZERO {
            break;
        }

        let balance = balances
            .get(&grant.id)
            .ok_or_else(|| EngineError::UnknownGrant {
                id: grant.id.to_string(),
            })?;
        if balance <= Decimal::ZERO {
            continue;
        }

        if balance <= remaining {
            balances.set(grant.id.clone(), Decimal::ZERO);
            remaining -= balance;
            usages.push(GrantUsage {
                grant_id: grant.id.clone(),
                usage: balance,
                termination_reason: GrantUsageTerminationReason::Exhausted,
            });
        } else {
            balances.burn(&grant.id, remaining);
            usages.push(GrantUsage {
                grant_id: grant.id.clone(),
                usage: remaining,
                termination_reason: GrantUsageTerminationReason::SegmentTermination,
            });
            remaining = Decimal::ZERO;
        }
    }

    Ok(BurnDownOutcome {
        balances,
        usages,
        overage: remaining.max(Decimal::ZERO),
    })
}
