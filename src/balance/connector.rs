//! The balance connector.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use super::policy::select_snapshot;
use super::{BalanceError, BalanceHistory, BalanceResult, ResetUsageParams};
use crate::clock::{Clock, SystemClock};
use crate::config::CreditSettings;
use crate::engine::{Engine, ResetBehavior, RunParams, RunResult, reset_snapshot};
use crate::events::{DomainEvent, EventPublisher, MemoryEventPublisher};
use crate::grant::{Grant, GrantId, GrantInput, GrantRepo, OwnerId};
use crate::owner::{EndCurrentUsagePeriodParams, OwnerDescription, OwnerDirectory};
use crate::snapshot::{Snapshot, SnapshotError, SnapshotRepo};
use crate::timeutil::{ClosedPeriod, ceil_to_minute, truncate_to_minute};
use crate::tx::{MemoryTransactionManager, Transaction, TransactionManager};
use crate::usage::{PeriodOptimizedQuerier, StreamingConnector};

/// Engine output together with the grants it ran over.
struct OwnerRun {
    grants: Vec<Grant>,
    result: RunResult,
}

/// Computes owner balances from grants, snapshots and metered usage, and
/// applies balance-affecting mutations under the owner lock.
///
/// Reads never lock. Snapshots are only persisted for history breakpoints
/// older than the configured grace period.
#[derive(Clone)]
pub struct BalanceConnector {
    grants: Arc<dyn GrantRepo>,
    snapshots: Arc<dyn SnapshotRepo>,
    owners: Arc<dyn OwnerDirectory>,
    streaming: Arc<dyn StreamingConnector>,
    transactions: Arc<dyn TransactionManager>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    settings: CreditSettings,
}

impl std::fmt::Debug for BalanceConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceConnector")
            .field("grants", &self.grants.name())
            .field("snapshots", &self.snapshots.name())
            .field("owners", &self.owners.name())
            .field("streaming", &self.streaming.name())
            .field("transactions", &self.transactions.name())
            .field("events", &self.events.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl BalanceConnector {
    pub fn builder() -> BalanceConnectorBuilder {
        BalanceConnectorBuilder::default()
    }

    pub fn settings(&self) -> &CreditSettings {
        &self.settings
    }

    /// Balance of `owner` at `at`, rounded up to the whole minute.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn get_balance_at(&self, owner: &OwnerId, at: DateTime<Utc>) -> BalanceResult<Snapshot> {
        let at = ceil_to_minute(at);
        let description = self.owners.describe_owner(owner).await?;
        Self::ensure_measured(&description, at)?;

        let starting = self.starting_snapshot(&description, at).await?;
        let run = self.run(&description, starting.clone(), at).await?;
        self.save_safe_snapshot(&description, &starting, &run).await?;

        let mut snapshot = run.result.snapshot;
        snapshot.retain_active(&run.grants);
        Ok(snapshot)
    }

    /// Balance at the end of `period` with the history covering exactly it.
    #[instrument(skip(self), fields(owner = %owner, period = %period))]
    pub async fn get_balance_for_period(
        &self,
        owner: &OwnerId,
        period: ClosedPeriod,
    ) -> BalanceResult<BalanceHistory> {
        let from = period.from;
        let to = ceil_to_minute(period.to);
        let description = self.owners.describe_owner(owner).await?;
        Self::ensure_measured(&description, from)?;

        let starting = self.starting_snapshot(&description, from).await?;
        let lead_in = self.run(&description, starting.clone(), from).await?;

        let mut at_from = lead_in.result.snapshot.clone();
        at_from.retain_active(&lead_in.grants);
        let within = self.run(&description, at_from, to).await?;

        let candidate = match self.safe_candidate(&description, &within)? {
            Some(candidate) => Some((candidate, &within.grants)),
            None => self
                .safe_candidate(&description, &lead_in)?
                .map(|candidate| (candidate, &lead_in.grants)),
        };
        if let Some((candidate, grants)) = candidate {
            self.save_candidate(&description, &starting, candidate, grants)
                .await?;
        }

        let mut snapshot = within.result.snapshot;
        snapshot.retain_active(&within.grants);
        Ok(BalanceHistory {
            snapshot,
            history: within.result.history,
        })
    }

    /// Continues burn-down from a caller-supplied snapshot. Nothing is
    /// persisted.
    #[instrument(skip(self, snapshot), fields(owner = %owner, from = %snapshot.at))]
    pub async fn get_balance_since_snapshot(
        &self,
        owner: &OwnerId,
        snapshot: Snapshot,
        at: DateTime<Utc>,
    ) -> BalanceResult<Snapshot> {
        let at = ceil_to_minute(at);
        if at < snapshot.at {
            return Err(BalanceError::validation(format!(
                "query instant {at} precedes snapshot at {}",
                snapshot.at
            )));
        }
        let description = self.owners.describe_owner(owner).await?;

        let run = self.run(&description, snapshot, at).await?;
        let mut snapshot = run.result.snapshot;
        snapshot.retain_active(&run.grants);
        Ok(snapshot)
    }

    pub async fn get_last_valid_snapshot_at(
        &self,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> BalanceResult<Snapshot> {
        Ok(self.snapshots.get_latest_valid_at(owner, at).await?)
    }

    /// Ends the current usage period at `params.at` and returns the starting
    /// balance of the new one.
    #[instrument(skip(self), fields(owner = %owner, at = %params.at))]
    pub async fn reset_usage_for_owner(
        &self,
        owner: &OwnerId,
        params: ResetUsageParams,
    ) -> BalanceResult<Snapshot> {
        let at = truncate_to_minute(params.at);
        let now = self.clock.now();
        if at > now {
            return Err(BalanceError::validation(format!(
                "reset at {at} is in the future"
            )));
        }

        let description = self.owners.describe_owner(owner).await?;
        Self::ensure_measured(&description, at)?;

        let behavior = ResetBehavior {
            preserve_overage: params
                .preserve_overage
                .unwrap_or(description.default_reset_behavior.preserve_overage),
        };

        let mut tx = self.transactions.begin().await?;
        let result = self
            .reset_in_tx(
                tx.as_mut(),
                &description,
                at,
                now,
                params.retain_anchor,
                behavior,
            )
            .await;
        let snapshot = Self::finish(tx, result).await?;

        info!(
            balance = %snapshot.balance(),
            overage = %snapshot.overage,
            preserve_overage = behavior.preserve_overage,
            "Usage reset"
        );
        Ok(snapshot)
    }

    /// Validates and stores a new grant, invalidating snapshots it affects.
    #[instrument(skip(self, input), fields(owner = %owner))]
    pub async fn create_grant(&self, owner: &OwnerId, input: GrantInput) -> BalanceResult<Grant> {
        let description = self.owners.describe_owner(owner).await?;
        let now = self.clock.now();
        let grant = Grant::from_input(description.id.clone(), input, now)?;

        let mut tx = self.transactions.begin().await?;
        let result = self.create_in_tx(tx.as_mut(), &grant, now).await;
        Self::finish(tx, result).await?;

        info!(
            grant_id = %grant.id,
            amount = %grant.amount,
            effective_at = %grant.effective_at,
            "Grant created"
        );
        Ok(grant)
    }

    #[instrument(skip(self), fields(owner = %owner, grant_id = %id))]
    pub async fn void_grant(&self, owner: &OwnerId, id: &GrantId) -> BalanceResult<Grant> {
        let at = truncate_to_minute(self.clock.now());

        let mut tx = self.transactions.begin().await?;
        let result = self.void_in_tx(tx.as_mut(), owner, id, at).await;
        let grant = Self::finish(tx, result).await?;

        info!(voided_at = %at, "Grant voided");
        Ok(grant)
    }

    async fn reset_in_tx(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerDescription,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        retain_anchor: bool,
        behavior: ResetBehavior,
    ) -> BalanceResult<Snapshot> {
        self.owners.lock_owner_for_tx(tx, &owner.id).await?;

        let current_start = self.owners.get_usage_period_start_at(&owner.id, now).await?;
        if at <= current_start {
            return Err(BalanceError::validation(format!(
                "reset at {at} must be after the current usage period start {current_start}"
            )));
        }

        let starting = self.starting_snapshot(owner, at).await?;
        let run = self.run(owner, starting, at).await?;
        let next = reset_snapshot(&run.grants, &run.result.snapshot, behavior, at).map_err(
            |source| BalanceError::Engine {
                owner: owner.id.to_string(),
                source,
            },
        )?;

        let invalidated = self.snapshots.invalidate_after(tx, &owner.id, at).await?;
        self.snapshots
            .save(Some(&mut *tx), &owner.id, std::slice::from_ref(&next))
            .await?;
        self.owners
            .end_current_usage_period(
                tx,
                &owner.id,
                EndCurrentUsagePeriodParams { at, retain_anchor },
            )
            .await?;
        self.events
            .publish(
                tx,
                DomainEvent::UsageReset {
                    owner: owner.id.clone(),
                    at,
                    retain_anchor,
                    preserve_overage: behavior.preserve_overage,
                },
            )
            .await?;

        debug!(invalidated, "Invalidated snapshots after reset");
        Ok(next)
    }

    async fn create_in_tx(
        &self,
        tx: &mut dyn Transaction,
        grant: &Grant,
        now: DateTime<Utc>,
    ) -> BalanceResult<()> {
        self.owners.lock_owner_for_tx(tx, &grant.owner_id).await?;

        let current_start = self
            .owners
            .get_usage_period_start_at(&grant.owner_id, now)
            .await?;
        if grant.effective_at < current_start {
            return Err(BalanceError::validation(format!(
                "grant effective at {} precedes the current usage period start {current_start}",
                grant.effective_at
            )));
        }
        self.grants.create(tx, grant).await?;
        let invalidated = self
            .snapshots
            .invalidate_after(tx, &grant.owner_id, grant.effective_at)
            .await?;
        self.events
            .publish(
                tx,
                DomainEvent::GrantCreated {
                    owner: grant.owner_id.clone(),
                    grant: grant.clone(),
                },
            )
            .await?;

        debug!(invalidated, "Invalidated snapshots after grant creation");
        Ok(())
    }

    async fn void_in_tx(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        id: &GrantId,
        at: DateTime<Utc>,
    ) -> BalanceResult<Grant> {
        self.owners.lock_owner_for_tx(tx, owner).await?;
        self.grants.void(tx, owner, id, at).await?;
        let grant = self.grants.get(owner, id).await?;
        let invalidated = self.snapshots.invalidate_after(tx, owner, at).await?;
        self.events
            .publish(
                tx,
                DomainEvent::GrantVoided {
                    owner: owner.clone(),
                    grant: grant.clone(),
                },
            )
            .await?;

        debug!(invalidated, "Invalidated snapshots after void");
        Ok(grant)
    }

    /// Commits on success, rolls back otherwise.
    async fn finish<T>(tx: Box<dyn Transaction>, result: BalanceResult<T>) -> BalanceResult<T> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    fn ensure_measured(owner: &OwnerDescription, at: DateTime<Utc>) -> BalanceResult<()> {
        if at < owner.measure_usage_from {
            return Err(BalanceError::validation(format!(
                "{at} precedes the start of usage measurement {}",
                owner.measure_usage_from
            )));
        }
        Ok(())
    }

    /// Latest valid snapshot at or before `at`, or the start of measurement.
    async fn starting_snapshot(
        &self,
        owner: &OwnerDescription,
        at: DateTime<Utc>,
    ) -> BalanceResult<Snapshot> {
        match self.snapshots.get_latest_valid_at(&owner.id, at).await {
            Ok(snapshot) => Ok(snapshot),
            Err(SnapshotError::NotFound { .. }) => {
                let from = owner.measure_usage_from;
                let since = self.owners.get_usage_period_start_at(&owner.id, from).await?;
                debug!(%from, "No snapshot found, starting from measurement start");
                Ok(Snapshot::starting(&[], from, since))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn run(
        &self,
        owner: &OwnerDescription,
        mut starting: Snapshot,
        until: DateTime<Utc>,
    ) -> BalanceResult<OwnerRun> {
        let owner_id = owner.id.to_string();
        let grants = self
            .grants
            .list_active_between(&owner.id, starting.at, until)
            .await?;

        if let Some((stray, _)) = starting
            .balances
            .iter()
            .find(|(id, _)| !grants.iter().any(|g| &g.id == *id))
        {
            return Err(BalanceError::InconsistentState {
                owner: owner_id,
                message: format!(
                    "snapshot at {} holds a balance for unknown grant {stray}",
                    starting.at
                ),
            });
        }

        for grant in &grants {
            if !starting.balances.contains(&grant.id) {
                let balance = if grant.active_at(starting.at) {
                    grant.amount
                } else {
                    Decimal::ZERO
                };
                starting.balances.set(grant.id.clone(), balance);
            }
        }

        let bound = ClosedPeriod::new(starting.at, until).map_err(|e| BalanceError::Engine {
            owner: owner_id.clone(),
            source: e.into(),
        })?;
        let resets = self
            .owners
            .get_reset_timeline_inclusive(&owner.id, bound)
            .await?;
        let querier = PeriodOptimizedQuerier::new(
            Arc::clone(&self.streaming),
            self.owners.as_ref(),
            owner.clone(),
            bound,
        )
        .await
        .map_err(|source| BalanceError::Usage {
            owner: owner_id.clone(),
            source,
        })?;

        let result = Engine::new(Arc::new(querier))
            .run(RunParams {
                grants: grants.clone(),
                starting_snapshot: starting,
                until,
                reset_behavior: owner.default_reset_behavior,
                resets,
            })
            .await
            .map_err(|source| BalanceError::Engine {
                owner: owner_id,
                source,
            })?;

        Ok(OwnerRun { grants, result })
    }

    fn safe_candidate(
        &self,
        owner: &OwnerDescription,
        run: &OwnerRun,
    ) -> BalanceResult<Option<Snapshot>> {
        if !self.settings.snapshots_enabled {
            return Ok(None);
        }
        select_snapshot(
            &run.result.history,
            self.clock.now(),
            self.settings.snapshot_grace_period(),
        )
        .map_err(|source| BalanceError::Engine {
            owner: owner.id.to_string(),
            source,
        })
    }

    async fn save_safe_snapshot(
        &self,
        owner: &OwnerDescription,
        starting: &Snapshot,
        run: &OwnerRun,
    ) -> BalanceResult<()> {
        match self.safe_candidate(owner, run)? {
            Some(candidate) => {
                self.save_candidate(owner, starting, candidate, &run.grants)
                    .await
            }
            None => {
                debug!("No history breakpoint outside the grace period");
                Ok(())
            }
        }
    }

    async fn save_candidate(
        &self,
        owner: &OwnerDescription,
        starting: &Snapshot,
        mut candidate: Snapshot,
        grants: &[Grant],
    ) -> BalanceResult<()> {
        if candidate.at == starting.at {
            debug!(at = %candidate.at, "Snapshot already persisted");
            return Ok(());
        }
        if candidate.at < starting.at {
            warn!(
                candidate = %candidate.at,
                starting = %starting.at,
                "Snapshot candidate precedes the starting snapshot"
            );
            return Err(BalanceError::InconsistentState {
                owner: owner.id.to_string(),
                message: format!(
                    "snapshot candidate at {} precedes starting snapshot at {}",
                    candidate.at, starting.at
                ),
            });
        }

        candidate.retain_active(grants);
        self.snapshots
            .save(None, &owner.id, std::slice::from_ref(&candidate))
            .await?;
        info!(
            at = %candidate.at,
            balance = %candidate.balance(),
            overage = %candidate.overage,
            "Saved balance snapshot"
        );
        Ok(())
    }
}

/// Assembles a [`BalanceConnector`]. Transactions and events default to the
/// in-memory implementations and the clock to the system clock.
#[derive(Default)]
pub struct BalanceConnectorBuilder {
    grants: Option<Arc<dyn GrantRepo>>,
    snapshots: Option<Arc<dyn SnapshotRepo>>,
    owners: Option<Arc<dyn OwnerDirectory>>,
    streaming: Option<Arc<dyn StreamingConnector>>,
    transactions: Option<Arc<dyn TransactionManager>>,
    events: Option<Arc<dyn EventPublisher>>,
    clock: Option<Arc<dyn Clock>>,
    settings: CreditSettings,
}

impl BalanceConnectorBuilder {
    pub fn grants(mut self, grants: Arc<dyn GrantRepo>) -> Self {
        self.grants = Some(grants);
        self
    }

    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotRepo>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn owners(mut self, owners: Arc<dyn OwnerDirectory>) -> Self {
        self.owners = Some(owners);
        self
    }

    pub fn streaming(mut self, streaming: Arc<dyn StreamingConnector>) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub fn transactions(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn settings(mut self, settings: CreditSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> BalanceResult<BalanceConnector> {
        self.settings.validate()?;
        Ok(BalanceConnector {
            grants: self
                .grants
                .ok_or(BalanceError::MissingDependency { name: "grants" })?,
            snapshots: self
                .snapshots
                .ok_or(BalanceError::MissingDependency { name: "snapshots" })?,
            owners: self
                .owners
                .ok_or(BalanceError::MissingDependency { name: "owners" })?,
            streaming: self
                .streaming
                .ok_or(BalanceError::MissingDependency { name: "streaming" })?,
            transactions: self
                .transactions
                .unwrap_or_else(|| Arc::new(MemoryTransactionManager::new())),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(MemoryEventPublisher::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            settings: self.settings,
        })
    }
}
