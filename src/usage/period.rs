//! Usage querier with usage period starts resolved once per run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use super::querier::OwnerMeterQuery;
use super::{StreamingConnector, UsageError, UsageQuerier, UsageResult};
use crate::owner::{OwnerDescription, OwnerDirectory};
use crate::timeutil::{ClosedPeriod, Timeline};

/// Serves usage queries within `bound` from a precomputed timeline of usage
/// period starts instead of asking the owner directory on every call.
#[derive(Debug, Clone)]
pub struct PeriodOptimizedQuerier {
    query: OwnerMeterQuery,
    bound: ClosedPeriod,
    period_starts: Timeline,
}

impl PeriodOptimizedQuerier {
    pub async fn new(
        connector: Arc<dyn StreamingConnector>,
        owners: &dyn OwnerDirectory,
        owner: OwnerDescription,
        bound: ClosedPeriod,
    ) -> UsageResult<Self> {
        let first = owners.get_usage_period_start_at(&owner.id, bound.from).await?;
        let resets = owners.get_reset_timeline_inclusive(&owner.id, bound).await?;

        let period_starts = Timeline::new(
            std::iter::once(first)
                .chain(resets.iter().filter(|t| *t > bound.from))
                .chain(std::iter::once(bound.to)),
        );

        debug!(
            owner = %owner.id,
            bound = %bound,
            period_starts = period_starts.len(),
            "Precomputed usage period starts"
        );

        Ok(Self {
            query: OwnerMeterQuery::new(connector, owner),
            bound,
            period_starts,
        })
    }

    pub fn bound(&self) -> ClosedPeriod {
        self.bound
    }

    pub fn period_starts(&self) -> &Timeline {
        &self.period_starts
    }

    fn period_start_at(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.period_starts
            .latest_at_or_before(at)
            .unwrap_or(self.bound.from)
    }
}

#[async_trait::async_trait]
impl UsageQuerier for PeriodOptimizedQuerier {
    async fn query_usage(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> UsageResult<Decimal> {
        if from < self.bound.from || to > self.bound.to || from > to {
            return Err(UsageError::OutOfBounds {
                from,
                to,
                bound: self.bound,
            });
        }

        self.query
            .usage_since(self.period_start_at(from), from, to)
            .await
    }
}
