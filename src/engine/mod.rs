//! Burn-down engine.
//!
//! The engine walks a period phase by phase, queries usage for each phase
//! through a [`UsageQuerier`](crate::usage::UsageQuerier), burns it from the
//! active grants in priority order and records one history segment per
//! phase. Usage period resets split the period; at every reset the ending
//! snapshot is rolled over into the next usage period.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use credit_engine::engine::{Engine, ResetBehavior, RunParams};
//! use credit_engine::snapshot::Snapshot;
//! use credit_engine::timeutil::Timeline;
//! # use credit_engine::usage::UsageQuerier;
//!
//! # async fn example(querier: Arc<dyn UsageQuerier>, grants: Vec<credit_engine::grant::Grant>)
//! # -> Result<(), Box<dyn std::error::Error>> {
//! let start = chrono::Utc::now();
//! let result = Engine::new(querier)
//!     .run(RunParams {
//!         starting_snapshot: Snapshot::starting(&grants, start, start),
//!         grants,
//!         until: start + chrono::Duration::days(30),
//!         reset_behavior: ResetBehavior::default(),
//!         resets: Timeline::default(),
//!     })
//!     .await?;
//! println!("balance: {}", result.snapshot.balance());
//! # Ok(())
//! # }
//! ```

mod burndown;
mod history;
mod phases;
mod reset;
mod run;

pub use burndown::{BurnDownOutcome, GrantUsage, GrantUsageTerminationReason, burn_down_grants};
pub use history::{GrantBurnDownHistory, GrantBurnDownHistorySegment, SegmentTerminationReasons};
pub use phases::{BurnPhase, plan_phases};
pub use reset::{ResetBehavior, reset_snapshot};
pub use run::{Engine, RunParams, RunResult};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::timeutil::{ClosedPeriod, PeriodError};
use crate::usage::UsageError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Inconsistent engine input: {message}")]
    InconsistentInput { message: String },

    #[error("History segment {index} ({next}) overlaps the previous one ({previous})")]
    OverlappingSegments {
        index: usize,
        previous: ClosedPeriod,
        next: ClosedPeriod,
    },

    #[error("History segment index {index} out of range (len {len})")]
    SegmentIndexOutOfRange { index: usize, len: usize },

    #[error("Grant {id} is not part of the run")]
    UnknownGrant { id: String },

    #[error("Failed to query usage for [{from}, {to}): {source}")]
    Usage {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        #[source]
        source: UsageError,
    },

    #[error("Period error: {0}")]
    Period(#[from] PeriodError),
}

impl EngineError {
    /// Errors that indicate a caller or data bug rather than an I/O failure.
    pub fn is_input_consistency(&self) -> bool {
        !matches!(self, Self::Usage { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
