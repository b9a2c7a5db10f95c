//! Balance orchestration: snapshots, grants, usage and resets composed into
//! owner-level balance queries and mutations.

mod connector;
mod policy;

pub use connector::{BalanceConnector, BalanceConnectorBuilder};
pub use policy::select_snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::{EngineError, GrantBurnDownHistory};
use crate::events::EventError;
use crate::grant::GrantError;
use crate::owner::OwnerError;
use crate::snapshot::{Snapshot, SnapshotError};
use crate::tx::TxError;
use crate::usage::UsageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetUsageParams {
    pub at: DateTime<Utc>,
    /// Keep the usage period anchor instead of re-anchoring at `at`.
    pub retain_anchor: bool,
    /// Overrides the owner's default reset behavior.
    pub preserve_overage: Option<bool>,
}

/// Balance at the end of a period plus the history covering exactly it.
#[derive(Debug, Clone)]
pub struct BalanceHistory {
    pub snapshot: Snapshot,
    pub history: GrantBurnDownHistory,
}

#[derive(Error, Debug)]
pub enum BalanceError {
    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Inconsistent balance state for owner {owner}: {message}")]
    InconsistentState { owner: String, message: String },

    #[error("Burn-down failed for owner {owner}: {source}")]
    Engine {
        owner: String,
        #[source]
        source: EngineError,
    },

    #[error("Usage lookup failed for owner {owner}: {source}")]
    Usage {
        owner: String,
        #[source]
        source: UsageError,
    },

    #[error("Missing dependency: {name}")]
    MissingDependency { name: &'static str },

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
}

impl BalanceError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation { .. } => true,
            Self::Grant(e) => e.is_validation(),
            _ => false,
        }
    }
}

pub type BalanceResult<T> = std::result::Result<T, BalanceError>;
