//! Balance owners: their meter, usage periods and reset timeline.

mod memory;

pub use memory::MemoryOwnerDirectory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::ResetBehavior;
use crate::grant::OwnerId;
use crate::timeutil::{ClosedPeriod, PeriodError, Recurrence, Timeline};
use crate::tx::{Transaction, TxError};
use crate::usage::Meter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerDescription {
    pub id: OwnerId,
    pub meter: Meter,
    /// Subjects whose events count against the owner; empty means all.
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Usage before this instant is never attributed to grants.
    pub measure_usage_from: DateTime<Utc>,
    #[serde(default)]
    pub default_reset_behavior: ResetBehavior,
    /// Programmatic usage period, if any.
    pub usage_period: Option<Recurrence>,
}

impl OwnerDescription {
    pub fn new(id: impl Into<OwnerId>, meter: Meter, measure_usage_from: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            meter,
            subjects: Vec::new(),
            measure_usage_from,
            default_reset_behavior: ResetBehavior::default(),
            usage_period: None,
        }
    }

    pub fn with_subjects(mut self, subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_usage_period(mut self, usage_period: Recurrence) -> Self {
        self.usage_period = Some(usage_period);
        self
    }

    pub fn with_reset_behavior(mut self, behavior: ResetBehavior) -> Self {
        self.default_reset_behavior = behavior;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndCurrentUsagePeriodParams {
    pub at: DateTime<Utc>,
    /// Keep the usage period anchor instead of re-anchoring at `at`.
    pub retain_anchor: bool,
}

#[derive(Error, Debug)]
pub enum OwnerError {
    #[error("Owner not found: {owner}")]
    NotFound { owner: String },

    #[error("Owner storage error: {message}")]
    Storage { message: String },

    #[error("Period error: {0}")]
    Period(#[from] PeriodError),

    #[error("Transaction error: {0}")]
    Tx(#[from] TxError),
}

pub type OwnerResult<T> = std::result::Result<T, OwnerError>;

#[async_trait::async_trait]
pub trait OwnerDirectory: Send + Sync {
    fn name(&self) -> &str;

    async fn describe_owner(&self, owner: &OwnerId) -> OwnerResult<OwnerDescription>;

    /// Start of the usage period containing `at`.
    async fn get_usage_period_start_at(
        &self,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> OwnerResult<DateTime<Utc>>;

    /// Manual and programmatic resets within `[period.from, period.to]`.
    async fn get_reset_timeline_inclusive(
        &self,
        owner: &OwnerId,
        period: ClosedPeriod,
    ) -> OwnerResult<Timeline>;

    async fn end_current_usage_period(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        params: EndCurrentUsagePeriodParams,
    ) -> OwnerResult<()>;

    async fn lock_owner_for_tx(&self, tx: &mut dyn Transaction, owner: &OwnerId)
    -> OwnerResult<()>;
}
