//! Metered usage querying.

mod memory;
mod period;
mod querier;

pub use memory::{MemoryStreamingConnector, UsageEvent};
pub use period::PeriodOptimizedQuerier;
pub use querier::MeteredUsageQuerier;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::owner::OwnerError;
use crate::timeutil::{ClosedPeriod, PeriodError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeterAggregation {
    Sum,
    Count,
    Max,
    Latest,
}

impl MeterAggregation {
    /// Whether `agg([a, c)) == agg([a, b)) + agg([b, c))`.
    pub fn is_additive(self) -> bool {
        matches!(self, Self::Sum | Self::Count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Meter {
    pub slug: String,
    pub aggregation: MeterAggregation,
}

impl Meter {
    pub fn new(slug: impl Into<String>, aggregation: MeterAggregation) -> Self {
        Self {
            slug: slug.into(),
            aggregation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Restricts the query to these subjects; empty means all.
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Return one row per subject instead of a single aggregate.
    #[serde(default)]
    pub group_by_subject: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterRow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub subject: Option<String>,
    pub value: Decimal,
}

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("Usage query returned {count} rows, expected at most one")]
    AmbiguousRows { count: usize },

    #[error("Usage query [{from}, {to}) is outside of {bound}")]
    OutOfBounds {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bound: ClosedPeriod,
    },

    #[error("Streaming connector error: {message}")]
    Connector { message: String },

    #[error("Owner lookup failed: {0}")]
    Owner(#[from] OwnerError),

    #[error("Period error: {0}")]
    Period(#[from] PeriodError),
}

impl UsageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connector { .. })
    }
}

pub type UsageResult<T> = std::result::Result<T, UsageError>;

/// Raw access to metered events.
#[async_trait::async_trait]
pub trait StreamingConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn query_meter(&self, meter: &Meter, params: &QueryParams) -> UsageResult<Vec<MeterRow>>;
}

/// Usage of a single owner over `[from, to)`. Zero-length ranges yield zero.
#[async_trait::async_trait]
pub trait UsageQuerier: Send + Sync {
    async fn query_usage(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> UsageResult<Decimal>;
}
