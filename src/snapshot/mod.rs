//! Balance snapshots: the state needed to resume burn-down from an instant.

mod repository;

pub use repository::{MemorySnapshotRepo, SnapshotRepo};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grant::{BalanceMap, Grant};
use crate::tx::TxError;

/// Usage accumulated in the current usage period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshottedUsage {
    pub since: DateTime<Utc>,
    pub usage: Decimal,
}

impl SnapshottedUsage {
    pub fn zero_since(since: DateTime<Utc>) -> Self {
        Self {
            since,
            usage: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub balances: BalanceMap,
    pub overage: Decimal,
    pub usage: SnapshottedUsage,
    pub at: DateTime<Utc>,
}

impl Snapshot {
    /// Start-of-measurement state: full amounts for grants active at `at`,
    /// zero for the rest, no overage.
    pub fn starting(grants: &[Grant], at: DateTime<Utc>, usage_since: DateTime<Utc>) -> Self {
        let balances = grants
            .iter()
            .map(|g| {
                let balance = if g.active_at(at) {
                    g.amount
                } else {
                    Decimal::ZERO
                };
                (g.id.clone(), balance)
            })
            .collect();

        Self {
            balances,
            overage: Decimal::ZERO,
            usage: SnapshottedUsage::zero_since(usage_since),
            at,
        }
    }

    pub fn balance(&self) -> Decimal {
        self.balances.balance()
    }

    /// Drops balances of grants that aren't active at `self.at`.
    pub fn retain_active(&mut self, grants: &[Grant]) {
        let at = self.at;
        self.balances.retain(|id, _| {
            grants
                .iter()
                .find(|g| &g.id == id)
                .is_some_and(|g| g.active_at(at))
        });
    }
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("No valid snapshot for owner {owner} at or before {at}")]
    NotFound { owner: String, at: DateTime<Utc> },

    #[error("Snapshot storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transaction error: {0}")]
    Tx(#[from] TxError),
}

pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;
