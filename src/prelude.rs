//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types and traits
//! for wiring up a balance connector.
//!
//! # Usage
//!
//! ```rust
//! use credit_engine::prelude::*;
//! ```

// Core types
pub use crate::Error;
pub use crate::ErrorCategory;
pub use crate::Result;

// Orchestration
pub use crate::balance::{BalanceConnector, BalanceConnectorBuilder, BalanceHistory, ResetUsageParams};

// Engine
pub use crate::engine::{Engine, GrantBurnDownHistory, ResetBehavior, RunParams, RunResult};

// Grants
pub use crate::grant::{
    BalanceMap, ExpirationPeriod, Grant, GrantId, GrantInput, GrantRepo, MemoryGrantRepo, OwnerId,
};

// Snapshots
pub use crate::snapshot::{MemorySnapshotRepo, Snapshot, SnapshotRepo, SnapshottedUsage};

// Owners
pub use crate::owner::{MemoryOwnerDirectory, OwnerDescription, OwnerDirectory};

// Usage
pub use crate::usage::{
    MemoryStreamingConnector, Meter, MeterAggregation, StreamingConnector, UsageEvent,
    UsageQuerier,
};

// Time
pub use crate::clock::{Clock, MockClock, SystemClock};
pub use crate::timeutil::{ClosedPeriod, Recurrence, RecurrenceInterval, Timeline};

// Transactions & events
pub use crate::events::{DomainEvent, EventPublisher, MemoryEventPublisher};
pub use crate::tx::{MemoryTransactionManager, Transaction, TransactionManager};

// Configuration
pub use crate::config::{ConfigBuilder, ConfigProvider, CreditSettings};
