//! In-memory owner directory.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::RwLock;

use super::{
    EndCurrentUsagePeriodParams, OwnerDescription, OwnerDirectory, OwnerError, OwnerResult,
};
use crate::grant::OwnerId;
use crate::timeutil::{ClosedPeriod, Recurrence, Timeline};
use crate::tx::Transaction;

#[derive(Debug, Clone)]
struct OwnerRecord {
    description: OwnerDescription,
    /// Manual resets, in the order they were recorded.
    resets: Vec<EndCurrentUsagePeriodParams>,
}

impl OwnerRecord {
    /// Usage period recurrences with the instant each one takes over.
    fn epochs(&self) -> Vec<(DateTime<Utc>, Recurrence)> {
        let Some(base) = self.description.usage_period else {
            return Vec::new();
        };

        let mut resets = self.resets.clone();
        resets.sort_by_key(|r| r.at);

        let mut epochs = vec![(self.description.measure_usage_from, base)];
        epochs.extend(
            resets
                .iter()
                .filter(|r| !r.retain_anchor)
                .map(|r| (r.at, Recurrence::new(base.interval, r.at))),
        );
        epochs
    }

    fn latest_reset_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.resets.iter().map(|r| r.at).filter(|t| *t <= at).max()
    }
}

type OwnerStore = Arc<RwLock<HashMap<OwnerId, OwnerRecord>>>;

/// In-memory owner directory (for testing and single-instance deployments)
#[derive(Debug, Default, Clone)]
pub struct MemoryOwnerDirectory {
    owners: OwnerStore,
}

impl MemoryOwnerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, description: OwnerDescription) {
        self.owners.write().await.insert(
            description.id.clone(),
            OwnerRecord {
                description,
                resets: Vec::new(),
            },
        );
    }

    /// Manual resets recorded for `owner`, oldest first.
    pub async fn resets(&self, owner: &OwnerId) -> Vec<DateTime<Utc>> {
        let owners = self.owners.read().await;
        let mut resets: Vec<_> = owners
            .get(owner)
            .map(|r| r.resets.iter().map(|r| r.at).collect())
            .unwrap_or_default();
        resets.sort();
        resets
    }

    async fn record(&self, owner: &OwnerId) -> OwnerResult<OwnerRecord> {
        self.owners
            .read()
            .await
            .get(owner)
            .cloned()
            .ok_or_else(|| OwnerError::NotFound {
                owner: owner.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl OwnerDirectory for MemoryOwnerDirectory {
    fn name(&self) -> &str {
        "memory"
    }

    async fn describe_owner(&self, owner: &OwnerId) -> OwnerResult<OwnerDescription> {
        Ok(self.record(owner).await?.description)
    }

    async fn get_usage_period_start_at(
        &self,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> OwnerResult<DateTime<Utc>> {
        let record = self.record(owner).await?;
        let mut start = record.description.measure_usage_from;

        if let Some(reset) = record.latest_reset_at_or_before(at) {
            start = start.max(reset);
        }

        let epoch = record
            .epochs()
            .into_iter()
            .filter(|(from, _)| *from <= at)
            .last();
        if let Some((_, recurrence)) = epoch {
            start = start.max(recurrence.prev_before_or_at(at)?);
        }

        Ok(start)
    }

    async fn get_reset_timeline_inclusive(
        &self,
        owner: &OwnerId,
        period: ClosedPeriod,
    ) -> OwnerResult<Timeline> {
        let record = self.record(owner).await?;
        let measure_from = record.description.measure_usage_from;

        let mut times: Vec<DateTime<Utc>> = record
            .resets
            .iter()
            .map(|r| r.at)
            .filter(|t| period.contains_inclusive(*t))
            .collect();

        let epochs = record.epochs();
        for (idx, (epoch_start, recurrence)) in epochs.iter().enumerate() {
            let epoch_end = epochs.get(idx + 1).map(|(start, _)| *start);
            let lo = period.from.max(*epoch_start);

            let mut t = recurrence.prev_before_or_at(lo)?;
            if t < lo {
                t = recurrence.next_after(t)?;
            }
            while t <= period.to && epoch_end.is_none_or(|end| t < end) {
                if t > measure_from {
                    times.push(t);
                }
                t = recurrence.next_after(t)?;
            }
        }

        Ok(Timeline::new(times))
    }

    async fn end_current_usage_period(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        params: EndCurrentUsagePeriodParams,
    ) -> OwnerResult<()> {
        {
            let mut owners = self.owners.write().await;
            let record = owners.get_mut(owner).ok_or_else(|| OwnerError::NotFound {
                owner: owner.to_string(),
            })?;
            record.resets.push(params);
        }

        let store = Arc::clone(&self.owners);
        let owner = owner.clone();
        tx.register_rollback(Box::new(move || {
            async move {
                if let Some(record) = store.write().await.get_mut(&owner) {
                    record.resets.retain(|r| *r != params);
                }
            }
            .boxed()
        }));
        Ok(())
    }

    async fn lock_owner_for_tx(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
    ) -> OwnerResult<()> {
        self.record(owner).await?;
        tx.lock_owner(owner).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutil::RecurrenceInterval;
    use crate::tx::{MemoryTransactionManager, TransactionManager};
    use crate::usage::{Meter, MeterAggregation};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn daily_owner() -> OwnerDescription {
        OwnerDescription::new("owner", Meter::new("tokens", MeterAggregation::Sum), t0())
            .with_usage_period(Recurrence::new(RecurrenceInterval::Day, t0()))
    }

    #[tokio::test]
    async fn test_period_start_follows_recurrence() {
        let directory = MemoryOwnerDirectory::new();
        directory.register(daily_owner()).await;
        let owner = OwnerId::new("owner");

        let start = directory
            .get_usage_period_start_at(&owner, t0() + Duration::hours(30))
            .await
            .unwrap();
        assert_eq!(start, t0() + Duration::days(1));
    }

    #[tokio::test]
    async fn test_reset_timeline_mixes_manual_and_programmatic() {
        let directory = MemoryOwnerDirectory::new();
        let txm = MemoryTransactionManager::new();
        directory.register(daily_owner()).await;
        let owner = OwnerId::new("owner");

        let mut tx = txm.begin().await.unwrap();
        directory
            .end_current_usage_period(
                tx.as_mut(),
                &owner,
                EndCurrentUsagePeriodParams {
                    at: t0() + Duration::hours(36),
                    retain_anchor: false,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let timeline = directory
            .get_reset_timeline_inclusive(
                &owner,
                ClosedPeriod::new(t0(), t0() + Duration::hours(84)).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            timeline.times(),
            &[
                t0() + Duration::hours(24),
                t0() + Duration::hours(36),
                t0() + Duration::hours(60),
                t0() + Duration::hours(84),
            ]
        );

        let start = directory
            .get_usage_period_start_at(&owner, t0() + Duration::hours(50))
            .await
            .unwrap();
        assert_eq!(start, t0() + Duration::hours(36));
    }

    #[tokio::test]
    async fn test_retained_anchor_keeps_schedule() {
        let directory = MemoryOwnerDirectory::new();
        let txm = MemoryTransactionManager::new();
        directory.register(daily_owner()).await;
        let owner = OwnerId::new("owner");

        let mut tx = txm.begin().await.unwrap();
        directory
            .end_current_usage_period(
                tx.as_mut(),
                &owner,
                EndCurrentUsagePeriodParams {
                    at: t0() + Duration::hours(36),
                    retain_anchor: true,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let timeline = directory
            .get_reset_timeline_inclusive(
                &owner,
                ClosedPeriod::new(t0() + Duration::hours(30), t0() + Duration::hours(48)).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            timeline.times(),
            &[t0() + Duration::hours(36), t0() + Duration::hours(48)]
        );
    }

    #[tokio::test]
    async fn test_rollback_forgets_reset() {
        let directory = MemoryOwnerDirectory::new();
        let txm = MemoryTransactionManager::new();
        directory.register(daily_owner()).await;
        let owner = OwnerId::new("owner");

        let mut tx = txm.begin().await.unwrap();
        directory.lock_owner_for_tx(tx.as_mut(), &owner).await.unwrap();
        directory
            .end_current_usage_period(
                tx.as_mut(),
                &owner,
                EndCurrentUsagePeriodParams {
                    at: t0() + Duration::hours(5),
                    retain_anchor: true,
                },
            )
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(directory.resets(&owner).await.is_empty());
        assert!(!txm.is_locked(&owner));
    }

    #[tokio::test]
    async fn test_unknown_owner() {
        let directory = MemoryOwnerDirectory::new();
        let err = directory
            .describe_owner(&OwnerId::new("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, OwnerError::NotFound { .. }));
    }
}
