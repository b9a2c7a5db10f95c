//! # credit-engine
//!
//! Grant burn-down and balance snapshots for usage-based credit billing.
//!
//! Owners hold prioritized credit grants that are consumed by metered usage.
//! The [`Engine`] walks a period phase by phase, burning usage against the
//! active grants and applying recurrences, expirations and usage-period
//! resets. The [`BalanceConnector`] composes the engine with grant, snapshot
//! and owner storage so balances can be answered from the latest safe
//! snapshot instead of replaying all history.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chrono::{Duration, Utc};
//! use credit_engine::prelude::*;
//! use credit_engine::timeutil::truncate_to_minute;
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), credit_engine::Error> {
//!     let owners = Arc::new(MemoryOwnerDirectory::new());
//!     let streaming = Arc::new(MemoryStreamingConnector::new());
//!     let start = truncate_to_minute(Utc::now() - Duration::days(7));
//!
//!     owners
//!         .register(OwnerDescription::new(
//!             "owner-1",
//!             Meter::new("api_calls", MeterAggregation::Sum),
//!             start,
//!         ))
//!         .await;
//!
//!     let connector = BalanceConnector::builder()
//!         .grants(Arc::new(MemoryGrantRepo::new()))
//!         .snapshots(Arc::new(MemorySnapshotRepo::new()))
//!         .owners(owners)
//!         .streaming(streaming)
//!         .build()?;
//!
//!     let owner = OwnerId::from("owner-1");
//!     connector
//!         .create_grant(&owner, GrantInput::new(Decimal::from(100), start))
//!         .await?;
//!
//!     let snapshot = connector.get_balance_at(&owner, Utc::now()).await?;
//!     println!("balance: {}", snapshot.balance());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod balance;
pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod grant;
pub mod owner;
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;
pub mod prelude;
pub mod snapshot;
pub mod timeutil;
pub mod tx;
pub mod usage;

// Re-exports for convenience
pub use balance::{
    BalanceConnector, BalanceConnectorBuilder, BalanceError, BalanceHistory, BalanceResult,
    ResetUsageParams, select_snapshot,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{
    CompositeConfigProvider, ConfigBuilder, ConfigError, ConfigProvider, ConfigProviderExt,
    CreditSettings, EnvConfigProvider, MemoryConfigProvider,
};
pub use engine::{
    BurnDownOutcome, BurnPhase, Engine, EngineError, EngineResult, GrantBurnDownHistory,
    GrantBurnDownHistorySegment, GrantUsage, GrantUsageTerminationReason, ResetBehavior,
    RunParams, RunResult, SegmentTerminationReasons, burn_down_grants, plan_phases,
    reset_snapshot,
};
pub use events::{DomainEvent, EventError, EventPublisher, MemoryEventPublisher};
pub use grant::{
    BalanceMap, ExpirationPeriod, Grant, GrantError, GrantId, GrantInput, GrantRepo,
    MemoryGrantRepo, OwnerId, prioritize_grants,
};
pub use owner::{
    EndCurrentUsagePeriodParams, MemoryOwnerDirectory, OwnerDescription, OwnerDirectory,
    OwnerError,
};
pub use snapshot::{MemorySnapshotRepo, Snapshot, SnapshotError, SnapshotRepo, SnapshottedUsage};
pub use timeutil::{
    ClosedPeriod, OpenPeriod, PeriodError, Recurrence, RecurrenceInterval, Timeline,
    ceil_to_minute, truncate_to_minute,
};
pub use tx::{
    MemoryTransaction, MemoryTransactionManager, Transaction, TransactionManager, TxError,
};
pub use usage::{
    MemoryStreamingConnector, Meter, MeterAggregation, MeterRow, MeteredUsageQuerier,
    PeriodOptimizedQuerier, QueryParams, StreamingConnector, UsageError, UsageEvent,
    UsageQuerier,
};

#[cfg(feature = "postgres")]
pub use postgres::{PgTransactionManager, PostgresGrantRepo, PostgresSnapshotRepo};

/// Error type for credit-engine operations.
///
/// Module errors convert into this type; [`Error::category`] groups them for
/// callers that only care how to react.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request itself is invalid (bad amounts, future resets, ...).
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Stored or supplied state contradicts itself.
    #[error("Inconsistent state: {message}")]
    InconsistentState { message: String },

    #[error("Burn-down failed{}: {source}", owner_suffix(.owner))]
    Engine {
        owner: Option<String>,
        #[source]
        source: EngineError,
    },

    #[error("Usage lookup failed{}: {source}", owner_suffix(.owner))]
    Usage {
        owner: Option<String>,
        #[source]
        source: UsageError,
    },

    #[error(transparent)]
    Grant(#[from] GrantError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Owner(#[from] OwnerError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Missing dependency: {0}")]
    MissingDependency(&'static str),
}

fn owner_suffix(owner: &Option<String>) -> String {
    owner
        .as_deref()
        .map(|o| format!(" for owner {o}"))
        .unwrap_or_default()
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Data handed to or loaded by the engine doesn't add up
    InputConsistency,
    /// The caller asked for something that isn't allowed
    Validation,
    /// A grant, snapshot or owner doesn't exist
    NotFound,
    /// Storage, locking or connector failures that may succeed on retry
    Transient,
    /// Missing wiring or bad settings
    Configuration,
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation { .. } => ErrorCategory::Validation,
            Error::InconsistentState { .. } => ErrorCategory::InputConsistency,
            Error::Engine { source, .. } => engine_category(source),
            Error::Usage { source, .. } => usage_category(source),
            Error::Grant(e) => grant_category(e),
            Error::Snapshot(e) => match e {
                SnapshotError::NotFound { .. } => ErrorCategory::NotFound,
                SnapshotError::Serialization(_) => ErrorCategory::InputConsistency,
                SnapshotError::Storage { .. } => ErrorCategory::Transient,
                SnapshotError::Tx(e) => tx_category(e),
            },
            Error::Owner(e) => owner_category(e),
            Error::Tx(e) => tx_category(e),
            Error::Event(e) => match e {
                EventError::Publish { .. } => ErrorCategory::Transient,
                EventError::Serialization(_) => ErrorCategory::InputConsistency,
            },
            Error::Config(_) | Error::MissingDependency(_) => ErrorCategory::Configuration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_validation_error(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    pub fn is_input_consistency(&self) -> bool {
        self.category() == ErrorCategory::InputConsistency
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }
}

fn engine_category(err: &EngineError) -> ErrorCategory {
    match err {
        EngineError::Usage { source, .. } => usage_category(source),
        EngineError::Period(_) => ErrorCategory::Validation,
        EngineError::InconsistentInput { .. }
        | EngineError::OverlappingSegments { .. }
        | EngineError::SegmentIndexOutOfRange { .. }
        | EngineError::UnknownGrant { .. } => ErrorCategory::InputConsistency,
    }
}

fn usage_category(err: &UsageError) -> ErrorCategory {
    match err {
        UsageError::Connector { .. } => ErrorCategory::Transient,
        UsageError::Owner(e) => owner_category(e),
        UsageError::Period(_) => ErrorCategory::Validation,
        UsageError::AmbiguousRows { .. } | UsageError::OutOfBounds { .. } => {
            ErrorCategory::InputConsistency
        }
    }
}

fn grant_category(err: &GrantError) -> ErrorCategory {
    match err {
        GrantError::NotFound { .. } => ErrorCategory::NotFound,
        GrantError::Storage { .. } => ErrorCategory::Transient,
        GrantError::Tx(e) => tx_category(e),
        _ => ErrorCategory::Validation,
    }
}

fn owner_category(err: &OwnerError) -> ErrorCategory {
    match err {
        OwnerError::NotFound { .. } => ErrorCategory::NotFound,
        OwnerError::Storage { .. } => ErrorCategory::Transient,
        OwnerError::Period(_) => ErrorCategory::Validation,
        OwnerError::Tx(e) => tx_category(e),
    }
}

fn tx_category(err: &TxError) -> ErrorCategory {
    match err {
        TxError::BackendMismatch { .. } => ErrorCategory::Configuration,
        TxError::Lock { .. } | TxError::Storage { .. } => ErrorCategory::Transient,
    }
}

impl From<EngineError> for Error {
    fn from(source: EngineError) -> Self {
        Error::Engine {
            owner: None,
            source,
        }
    }
}

impl From<UsageError> for Error {
    fn from(source: UsageError) -> Self {
        Error::Usage {
            owner: None,
            source,
        }
    }
}

impl From<PeriodError> for Error {
    fn from(err: PeriodError) -> Self {
        Error::validation(err.to_string())
    }
}

impl From<BalanceError> for Error {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::Validation { message } => Error::Validation { message },
            BalanceError::InconsistentState { owner, message } => Error::InconsistentState {
                message: format!("owner {owner}: {message}"),
            },
            BalanceError::Engine { owner, source } => Error::Engine {
                owner: Some(owner),
                source,
            },
            BalanceError::Usage { owner, source } => Error::Usage {
                owner: Some(owner),
                source,
            },
            BalanceError::MissingDependency { name } => Error::MissingDependency(name),
            BalanceError::Grant(e) => Error::Grant(e),
            BalanceError::Snapshot(e) => Error::Snapshot(e),
            BalanceError::Owner(e) => Error::Owner(e),
            BalanceError::Tx(e) => Error::Tx(e),
            BalanceError::Event(e) => Error::Event(e),
            BalanceError::Config(e) => Error::Config(e),
        }
    }
}

/// Result type alias for credit-engine operations.
pub type Result<T> = std::result::Result<T, Error>;
