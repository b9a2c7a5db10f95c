//! Balance Connector Tests
//!
//! Owner-level balance queries, snapshot persistence, resets and grant
//! mutations against the in-memory backends.
//!
//! Run: cargo nextest run --test balance_tests

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use credit_engine::balance::{BalanceConnector, ResetUsageParams};
use credit_engine::clock::MockClock;
use credit_engine::config::CreditSettings;
use credit_engine::events::{
    DomainEvent, EventError, EventPublisher, EventResult, MemoryEventPublisher,
};
use credit_engine::grant::{Grant, GrantInput, MemoryGrantRepo, OwnerId};
use credit_engine::owner::{MemoryOwnerDirectory, OwnerDescription};
use credit_engine::snapshot::{MemorySnapshotRepo, Snapshot};
use credit_engine::timeutil::ClosedPeriod;
use credit_engine::tx::Transaction;
use credit_engine::usage::{Meter, MeterAggregation, MemoryStreamingConnector, UsageEvent};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const METER: &str = "tokens";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn day(n: i64) -> DateTime<Utc> {
    t0() + Duration::days(n)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    connector: BalanceConnector,
    grants: Arc<MemoryGrantRepo>,
    snapshots: Arc<MemorySnapshotRepo>,
    owners: Arc<MemoryOwnerDirectory>,
    events: Arc<MemoryEventPublisher>,
    clock: MockClock,
    owner: OwnerId,
}

impl Harness {
    async fn new() -> Self {
        Self::with_publisher(None).await
    }

    async fn with_publisher(publisher: Option<Arc<dyn EventPublisher>>) -> Self {
        init_tracing();

        let grants = Arc::new(MemoryGrantRepo::new());
        let snapshots = Arc::new(MemorySnapshotRepo::new());
        let owners = Arc::new(MemoryOwnerDirectory::new());
        let streaming = Arc::new(MemoryStreamingConnector::new());
        let events = Arc::new(MemoryEventPublisher::new());
        let clock = MockClock::new(day(10));
        let owner = OwnerId::new("acme");

        owners
            .register(OwnerDescription::new(
                owner.clone(),
                Meter::new(METER, MeterAggregation::Sum),
                t0(),
            ))
            .await;
        streaming
            .add_events(
                METER,
                [
                    UsageEvent::new("acme-api", t0() + Duration::hours(1), dec!(30)),
                    UsageEvent::new("acme-api", day(2), dec!(20)),
                ],
            )
            .await;

        let connector = BalanceConnector::builder()
            .grants(grants.clone())
            .snapshots(snapshots.clone())
            .owners(owners.clone())
            .streaming(streaming)
            .events(publisher.unwrap_or_else(|| events.clone() as Arc<dyn EventPublisher>))
            .clock(Arc::new(clock.clone()))
            .settings(CreditSettings::default())
            .build()
            .unwrap();

        Self {
            connector,
            grants,
            snapshots,
            owners,
            events,
            clock,
            owner,
        }
    }

    /// g1: 100 from t0, keeps up to 40 over a reset. g2: 100 from day 3.
    async fn with_grants() -> (Self, Grant, Grant) {
        let harness = Self::new().await;
        let g1 = harness
            .connector
            .create_grant(
                &harness.owner,
                GrantInput::new(dec!(100), t0()).rollover(dec!(0), dec!(40)),
            )
            .await
            .unwrap();
        let g2 = harness
            .connector
            .create_grant(&harness.owner, GrantInput::new(dec!(100), day(3)))
            .await
            .unwrap();
        (harness, g1, g2)
    }

    async fn balance_at(&self, at: DateTime<Utc>) -> Snapshot {
        self.connector.get_balance_at(&self.owner, at).await.unwrap()
    }
}

struct RejectingPublisher;

#[async_trait::async_trait]
impl EventPublisher for RejectingPublisher {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn publish(&self, _tx: &mut dyn Transaction, event: DomainEvent) -> EventResult<()> {
        Err(EventError::Publish {
            kind: event.kind(),
            message: "broker unavailable".to_string(),
        })
    }
}

// =============================================================================
// Balance queries
// =============================================================================

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_balance_without_snapshots() {
        let (harness, g1, g2) = Harness::with_grants().await;

        let snapshot = harness.balance_at(day(5)).await;
        assert_eq!(snapshot.at, day(5));
        assert_eq!(snapshot.balances.get(&g1.id), Some(dec!(50)));
        assert_eq!(snapshot.balances.get(&g2.id), Some(dec!(100)));
        assert_eq!(snapshot.overage, dec!(0));
        assert_eq!(snapshot.usage.since, t0());
        assert_eq!(snapshot.usage.usage, dec!(50));
    }

    #[tokio::test]
    async fn test_query_instant_is_rounded_up_to_the_minute() {
        let (harness, _, _) = Harness::with_grants().await;
        let snapshot = harness.balance_at(day(5) + Duration::seconds(10)).await;
        assert_eq!(snapshot.at, day(5) + Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_safe_breakpoint_is_persisted_once() {
        let (harness, _, _) = Harness::with_grants().await;

        let first = harness.balance_at(day(5)).await;
        let saved = harness.snapshots.valid_snapshots(&harness.owner).await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].at, day(3));
        assert_eq!(saved[0].usage.usage, dec!(50));

        let second = harness.balance_at(day(5)).await;
        assert_eq!(first, second);
        assert_eq!(harness.snapshots.count(&harness.owner).await, 1);
    }

    #[tokio::test]
    async fn test_breakpoints_inside_grace_period_are_not_persisted() {
        let (harness, _, _) = Harness::with_grants().await;
        harness.clock.set(day(3) + Duration::minutes(30));

        harness.balance_at(day(3) + Duration::minutes(30)).await;
        assert_eq!(harness.snapshots.count(&harness.owner).await, 0);
    }

    #[tokio::test]
    async fn test_query_before_measurement_start_is_rejected() {
        let (harness, _, _) = Harness::with_grants().await;
        let err = harness
            .connector
            .get_balance_at(&harness.owner, t0() - Duration::hours(1))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_unknown_owner_is_not_found() {
        let harness = Harness::new().await;
        let err: credit_engine::Error = harness
            .connector
            .get_balance_at(&OwnerId::new("nobody"), day(1))
            .await
            .unwrap_err()
            .into();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_period_history_covers_exactly_the_period() {
        let (harness, g1, _) = Harness::with_grants().await;

        let period = ClosedPeriod::new(day(1), day(4)).unwrap();
        let result = harness
            .connector
            .get_balance_for_period(&harness.owner, period)
            .await
            .unwrap();

        let segments = result.history.segments();
        assert_eq!(segments.first().unwrap().period.from, day(1));
        assert_eq!(segments.last().unwrap().period.to, day(4));
        assert_eq!(result.history.total_usage(), dec!(20));
        assert_eq!(result.history.usage_at_start().usage, dec!(30));
        assert_eq!(result.snapshot.balances.get(&g1.id), Some(dec!(50)));
        assert_eq!(result.snapshot.usage.usage, dec!(50));
    }

    #[tokio::test]
    async fn test_continuing_from_a_supplied_snapshot() {
        let (harness, g1, g2) = Harness::with_grants().await;

        let at_day_1 = harness.balance_at(day(1)).await;
        let continued = harness
            .connector
            .get_balance_since_snapshot(&harness.owner, at_day_1, day(5))
            .await
            .unwrap();
        assert_eq!(continued, harness.balance_at(day(5)).await);
        assert_eq!(continued.balances.get(&g1.id), Some(dec!(50)));
        assert_eq!(continued.balances.get(&g2.id), Some(dec!(100)));
    }

    #[tokio::test]
    async fn test_supplied_snapshot_with_unknown_grant_is_inconsistent() {
        let (harness, _, _) = Harness::with_grants().await;

        let mut snapshot = harness.balance_at(day(1)).await;
        snapshot.balances.set("ghost".into(), dec!(5));
        let err: credit_engine::Error = harness
            .connector
            .get_balance_since_snapshot(&harness.owner, snapshot, day(2))
            .await
            .unwrap_err()
            .into();
        assert!(err.is_input_consistency());
    }
}

// =============================================================================
// Usage resets
// =============================================================================

mod reset_tests {
    use super::*;

    fn reset_at(at: DateTime<Utc>) -> ResetUsageParams {
        ResetUsageParams {
            at,
            retain_anchor: false,
            preserve_overage: None,
        }
    }

    #[tokio::test]
    async fn test_reset_rolls_over_and_starts_a_new_period() {
        let (harness, g1, g2) = Harness::with_grants().await;

        let started = harness
            .connector
            .reset_usage_for_owner(&harness.owner, reset_at(day(4)))
            .await
            .unwrap();
        assert_eq!(started.at, day(4));
        assert_eq!(started.balances.get(&g1.id), Some(dec!(40)));
        assert_eq!(started.balances.get(&g2.id), Some(dec!(0)));
        assert_eq!(started.usage.usage, dec!(0));

        let snapshot = harness.balance_at(day(5)).await;
        assert_eq!(snapshot.balance(), dec!(40));
        assert_eq!(snapshot.usage.since, day(4));
        assert_eq!(harness.owners.resets(&harness.owner).await, vec![day(4)]);

        let events = harness.events.events().await;
        assert!(matches!(events.last(), Some(DomainEvent::UsageReset { at, .. }) if *at == day(4)));
    }

    #[tokio::test]
    async fn test_reset_invalidates_later_snapshots() {
        let (harness, g1, g2) = Harness::with_grants().await;
        harness.balance_at(day(5)).await;
        assert_eq!(harness.snapshots.valid_snapshots(&harness.owner).await[0].at, day(3));

        harness
            .connector
            .reset_usage_for_owner(&harness.owner, reset_at(day(2)))
            .await
            .unwrap();
        let valid = harness.snapshots.valid_snapshots(&harness.owner).await;
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].at, day(2));
        assert_eq!(valid[0].balances.get(&g1.id), Some(dec!(40)));

        let snapshot = harness.balance_at(day(5)).await;
        assert_eq!(snapshot.balances.get(&g1.id), Some(dec!(20)));
        assert_eq!(snapshot.balances.get(&g2.id), Some(dec!(100)));
        assert_eq!(snapshot.usage.since, day(2));
        assert_eq!(snapshot.usage.usage, dec!(20));
    }

    #[tokio::test]
    async fn test_reset_must_follow_current_period_start() {
        let (harness, _, _) = Harness::with_grants().await;
        harness
            .connector
            .reset_usage_for_owner(&harness.owner, reset_at(day(4)))
            .await
            .unwrap();

        for at in [day(4), day(4) + Duration::seconds(30), day(3)] {
            let err = harness
                .connector
                .reset_usage_for_owner(&harness.owner, reset_at(at))
                .await
                .unwrap_err();
            assert!(err.is_validation(), "reset at {at} should be rejected");
        }
        assert_eq!(harness.owners.resets(&harness.owner).await.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_in_the_future_is_rejected() {
        let (harness, _, _) = Harness::with_grants().await;
        let err = harness
            .connector
            .reset_usage_for_owner(&harness.owner, reset_at(day(11)))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_grants_cannot_precede_the_current_period() {
        let (harness, _, _) = Harness::with_grants().await;
        harness
            .connector
            .reset_usage_for_owner(&harness.owner, reset_at(day(4)))
            .await
            .unwrap();

        let err = harness
            .connector
            .create_grant(&harness.owner, GrantInput::new(dec!(10), day(1)))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        harness
            .connector
            .create_grant(&harness.owner, GrantInput::new(dec!(10), day(4)))
            .await
            .unwrap();
    }
}

// =============================================================================
// Grant mutations
// =============================================================================

mod mutation_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_publishes_event() {
        let (harness, g1, g2) = Harness::with_grants().await;

        let created: Vec<_> = harness
            .events
            .events()
            .await
            .into_iter()
            .filter_map(|e| match e {
                DomainEvent::GrantCreated { grant, .. } => Some(grant.id),
                _ => None,
            })
            .collect();
        assert_eq!(created, vec![g1.id, g2.id]);
        assert_eq!(harness.grants.count(&harness.owner).await, 2);
    }

    #[tokio::test]
    async fn test_invalid_grants_are_rejected() {
        let harness = Harness::new().await;

        let err = harness
            .connector
            .create_grant(&harness.owner, GrantInput::new(dec!(0), t0()))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = harness
            .connector
            .create_grant(
                &harness.owner,
                GrantInput::new(dec!(10), t0()).rollover(dec!(5), dec!(1)),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(harness.grants.count(&harness.owner).await, 0);
    }

    #[tokio::test]
    async fn test_new_grant_invalidates_later_snapshots() {
        let (harness, _, _) = Harness::with_grants().await;
        harness.balance_at(day(5)).await;
        assert_eq!(harness.snapshots.valid_snapshots(&harness.owner).await.len(), 1);

        let g3 = harness
            .connector
            .create_grant(&harness.owner, GrantInput::new(dec!(5), day(1)).priority(0))
            .await
            .unwrap();
        assert!(harness.snapshots.valid_snapshots(&harness.owner).await.is_empty());

        let snapshot = harness.balance_at(day(5)).await;
        assert_eq!(snapshot.balances.get(&g3.id), Some(dec!(0)));
        assert_eq!(snapshot.balance(), dec!(155));
    }

    #[tokio::test]
    async fn test_void_stops_the_grant_from_now_on() {
        let (harness, g1, g2) = Harness::with_grants().await;

        let voided = harness
            .connector
            .void_grant(&harness.owner, &g2.id)
            .await
            .unwrap();
        assert_eq!(voided.voided_at, Some(day(10)));

        let before = harness.balance_at(day(9)).await;
        assert_eq!(before.balances.get(&g2.id), Some(dec!(100)));

        let after = harness.balance_at(day(10)).await;
        assert!(!after.balances.contains(&g2.id));
        assert_eq!(after.balances.get(&g1.id), Some(dec!(50)));

        let err = harness
            .connector
            .void_grant(&harness.owner, &g2.id)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        let voids = harness
            .events
            .events()
            .await
            .into_iter()
            .filter(|e| matches!(e, DomainEvent::GrantVoided { .. }))
            .count();
        assert_eq!(voids, 1);
    }

    #[tokio::test]
    async fn test_failed_publish_rolls_back_the_grant() {
        let harness = Harness::with_publisher(Some(Arc::new(RejectingPublisher))).await;

        let err: credit_engine::Error = harness
            .connector
            .create_grant(&harness.owner, GrantInput::new(dec!(10), t0()))
            .await
            .unwrap_err()
            .into();
        assert!(err.is_retryable());
        assert_eq!(harness.grants.count(&harness.owner).await, 0);

        let snapshot = harness.balance_at(day(1)).await;
        assert_eq!(snapshot.balance(), Decimal::ZERO);
        assert_eq!(snapshot.overage, dec!(30));
    }
}

// =============================================================================
// Concurrent mutations
// =============================================================================

mod concurrency_tests {
    use super::*;
    use credit_engine::owner::{EndCurrentUsagePeriodParams, OwnerDirectory, OwnerResult};
    use credit_engine::timeutil::Timeline;
    use credit_engine::tx::{MemoryTransactionManager, TransactionManager};

    /// Commits a competing reset just before the owner lock is granted, the
    /// way a concurrent mutation holding the lock would.
    struct ContendedOwners {
        inner: Arc<MemoryOwnerDirectory>,
        transactions: MemoryTransactionManager,
        competing_reset: std::sync::Mutex<Option<DateTime<Utc>>>,
    }

    #[async_trait::async_trait]
    impl OwnerDirectory for ContendedOwners {
        fn name(&self) -> &str {
            "contended"
        }

        async fn describe_owner(&self, owner: &OwnerId) -> OwnerResult<OwnerDescription> {
            self.inner.describe_owner(owner).await
        }

        async fn get_usage_period_start_at(
            &self,
            owner: &OwnerId,
            at: DateTime<Utc>,
        ) -> OwnerResult<DateTime<Utc>> {
            self.inner.get_usage_period_start_at(owner, at).await
        }

        async fn get_reset_timeline_inclusive(
            &self,
            owner: &OwnerId,
            period: ClosedPeriod,
        ) -> OwnerResult<Timeline> {
            self.inner.get_reset_timeline_inclusive(owner, period).await
        }

        async fn end_current_usage_period(
            &self,
            tx: &mut dyn Transaction,
            owner: &OwnerId,
            params: EndCurrentUsagePeriodParams,
        ) -> OwnerResult<()> {
            self.inner.end_current_usage_period(tx, owner, params).await
        }

        async fn lock_owner_for_tx(
            &self,
            tx: &mut dyn Transaction,
            owner: &OwnerId,
        ) -> OwnerResult<()> {
            let competing = self.competing_reset.lock().unwrap().take();
            if let Some(at) = competing {
                let mut other = self.transactions.begin().await?;
                self.inner
                    .end_current_usage_period(
                        other.as_mut(),
                        owner,
                        EndCurrentUsagePeriodParams {
                            at,
                            retain_anchor: false,
                        },
                    )
                    .await?;
                other.commit().await?;
            }
            self.inner.lock_owner_for_tx(tx, owner).await
        }
    }

    async fn contended(competing_reset: DateTime<Utc>) -> (Harness, BalanceConnector) {
        let harness = Harness::new().await;
        let owners = Arc::new(ContendedOwners {
            inner: harness.owners.clone(),
            transactions: MemoryTransactionManager::new(),
            competing_reset: std::sync::Mutex::new(Some(competing_reset)),
        });
        let streaming = Arc::new(MemoryStreamingConnector::new());
        let connector = BalanceConnector::builder()
            .grants(harness.grants.clone())
            .snapshots(harness.snapshots.clone())
            .owners(owners)
            .streaming(streaming)
            .events(harness.events.clone())
            .clock(Arc::new(harness.clock.clone()))
            .build()
            .unwrap();
        (harness, connector)
    }

    #[tokio::test]
    async fn test_reset_is_validated_against_resets_committed_while_waiting() {
        let (harness, connector) = contended(day(4)).await;

        let err = connector
            .reset_usage_for_owner(
                &harness.owner,
                ResetUsageParams {
                    at: day(3),
                    retain_anchor: false,
                    preserve_overage: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(harness.owners.resets(&harness.owner).await, vec![day(4)]);
    }

    #[tokio::test]
    async fn test_grant_is_validated_against_resets_committed_while_waiting() {
        let (harness, connector) = contended(day(4)).await;

        let err = connector
            .create_grant(&harness.owner, GrantInput::new(dec!(10), day(2)))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(harness.grants.count(&harness.owner).await, 0);
        assert!(harness.events.events().await.is_empty());
    }
}
