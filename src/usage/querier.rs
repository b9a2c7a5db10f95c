//! Direct usage querier over a streaming connector.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use super::{QueryParams, StreamingConnector, UsageError, UsageQuerier, UsageResult};
use crate::owner::{OwnerDescription, OwnerDirectory};
use crate::timeutil::PeriodError;

/// One owner's meter on a streaming connector.
#[derive(Clone)]
pub(crate) struct OwnerMeterQuery {
    connector: Arc<dyn StreamingConnector>,
    owner: OwnerDescription,
}

impl OwnerMeterQuery {
    pub(crate) fn new(connector: Arc<dyn StreamingConnector>, owner: OwnerDescription) -> Self {
        Self { connector, owner }
    }

    pub(crate) fn owner(&self) -> &OwnerDescription {
        &self.owner
    }

    pub(crate) fn is_additive(&self) -> bool {
        self.owner.meter.aggregation.is_additive()
    }

    /// Aggregate over `[from, to)`: zero for empty ranges or no rows.
    pub(crate) async fn aggregate(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> UsageResult<Decimal> {
        if from > to {
            return Err(PeriodError::Inverted { from, to }.into());
        }
        if from == to {
            return Ok(Decimal::ZERO);
        }

        let params = QueryParams {
            from,
            to,
            subjects: self.owner.subjects.clone(),
            group_by_subject: false,
        };
        let rows = self.connector.query_meter(&self.owner.meter, &params).await?;

        match rows.as_slice() {
            [] => Ok(Decimal::ZERO),
            [row] => Ok(row.value),
            rows => Err(UsageError::AmbiguousRows { count: rows.len() }),
        }
    }

    /// Usage over `[from, to)` for an aggregation that may not be additive,
    /// measured from `period_start`.
    pub(crate) async fn usage_since(
        &self,
        period_start: DateTime<Utc>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> UsageResult<Decimal> {
        if from == to {
            return Ok(Decimal::ZERO);
        }
        if self.is_additive() {
            return self.aggregate(from, to).await;
        }

        let until_to = self.aggregate(period_start, to).await?;
        let until_from = self.aggregate(period_start, from).await?;
        debug!(
            owner = %self.owner.id,
            %period_start,
            %from,
            %to,
            "Queried non-additive meter"
        );
        Ok(until_to - until_from)
    }
}

impl std::fmt::Debug for OwnerMeterQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerMeterQuery")
            .field("connector", &self.connector.name())
            .field("owner", &self.owner.id)
            .field("meter", &self.owner.meter.slug)
            .finish()
    }
}

/// Queries the connector directly, looking up the usage period start from
/// the owner directory on every non-additive query.
#[derive(Clone)]
pub struct MeteredUsageQuerier {
    query: OwnerMeterQuery,
    owners: Arc<dyn OwnerDirectory>,
}

impl MeteredUsageQuerier {
    pub fn new(
        connector: Arc<dyn StreamingConnector>,
        owners: Arc<dyn OwnerDirectory>,
        owner: OwnerDescription,
    ) -> Self {
        Self {
            query: OwnerMeterQuery::new(connector, owner),
            owners,
        }
    }
}

impl std::fmt::Debug for MeteredUsageQuerier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredUsageQuerier")
            .field("query", &self.query)
            .field("owners", &self.owners.name())
            .finish()
    }
}

#[async_trait::async_trait]
impl UsageQuerier for MeteredUsageQuerier {
    async fn query_usage(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> UsageResult<Decimal> {
        if from == to {
            return Ok(Decimal::ZERO);
        }
        if self.query.is_additive() {
            return self.query.aggregate(from, to).await;
        }

        let period_start = self
            .owners
            .get_usage_period_start_at(&self.query.owner().id, from)
            .await?;
        self.query.usage_since(period_start, from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::MemoryOwnerDirectory;
    use crate::usage::{
        Meter, MeterAggregation, MeterRow, MemoryStreamingConnector, UsageEvent,
    };
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn setup(aggregation: MeterAggregation) -> MeteredUsageQuerier {
        let connector = MemoryStreamingConnector::new();
        connector
            .add_events(
                "m",
                [
                    UsageEvent::new("s", t0() + Duration::hours(1), dec!(4)),
                    UsageEvent::new("s", t0() + Duration::hours(2), dec!(9)),
                    UsageEvent::new("s", t0() + Duration::hours(3), dec!(6)),
                ],
            )
            .await;
        let owner = OwnerDescription::new("o", Meter::new("m", aggregation), t0());
        let owners = MemoryOwnerDirectory::new();
        owners.register(owner.clone()).await;
        MeteredUsageQuerier::new(Arc::new(connector), Arc::new(owners), owner)
    }

    #[tokio::test]
    async fn test_additive_queries_range_directly() {
        let querier = setup(MeterAggregation::Sum).await;
        let usage = querier
            .query_usage(t0() + Duration::hours(2), t0() + Duration::hours(4))
            .await
            .unwrap();
        assert_eq!(usage, dec!(15));
    }

    #[tokio::test]
    async fn test_non_additive_uses_period_difference() {
        let querier = setup(MeterAggregation::Max).await;
        let usage = querier
            .query_usage(t0() + Duration::hours(2), t0() + Duration::hours(4))
            .await
            .unwrap();
        // max over [t0, 4h) is 9, max over [t0, 2h) is 4
        assert_eq!(usage, dec!(5));
    }

    #[tokio::test]
    async fn test_zero_length_and_empty_ranges() {
        let querier = setup(MeterAggregation::Sum).await;
        assert_eq!(querier.query_usage(t0(), t0()).await.unwrap(), dec!(0));
        assert_eq!(
            querier
                .query_usage(t0() + Duration::days(1), t0() + Duration::days(2))
                .await
                .unwrap(),
            dec!(0)
        );
    }

    struct GroupedConnector;

    #[async_trait::async_trait]
    impl StreamingConnector for GroupedConnector {
        fn name(&self) -> &str {
            "grouped"
        }

        async fn query_meter(&self, _: &Meter, params: &QueryParams) -> UsageResult<Vec<MeterRow>> {
            let row = MeterRow {
                window_start: params.from,
                window_end: params.to,
                subject: None,
                value: dec!(1),
            };
            Ok(vec![row.clone(), row])
        }
    }

    #[tokio::test]
    async fn test_multiple_rows_are_ambiguous() {
        let owner = OwnerDescription::new("o", Meter::new("m", MeterAggregation::Sum), t0());
        let querier = MeteredUsageQuerier::new(
            Arc::new(GroupedConnector),
            Arc::new(MemoryOwnerDirectory::new()),
            owner,
        );
        let err = querier
            .query_usage(t0(), t0() + Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, UsageError::AmbiguousRows { count: 2 }));
    }
}
