//! Grants: time-bound, prioritized credit allotments.

mod balance;
mod ids;
mod model;
mod prioritize;
pub mod repository;

pub use balance::BalanceMap;
pub use ids::{GrantId, OwnerId};
pub use model::{DEFAULT_PRIORITY, ExpirationPeriod, Grant, GrantInput};
pub use prioritize::prioritize_grants;
pub use repository::{GrantRepo, MemoryGrantRepo};

use rust_decimal::Decimal;
use thiserror::Error;

use crate::timeutil::PeriodError;
use crate::tx::TxError;

#[derive(Error, Debug)]
pub enum GrantError {
    #[error("Grant amount must be positive, got {amount}")]
    InvalidAmount { amount: Decimal },

    #[error("Invalid rollover bounds: {message}")]
    InvalidRollover { message: String },

    #[error("Grant expiration count must be positive")]
    InvalidExpiration,

    #[error("Grant not found: {id}")]
    NotFound { id: String },

    #[error("Grant already voided: {id}")]
    AlreadyVoided { id: String },

    #[error("Period error: {0}")]
    Period(#[from] PeriodError),

    #[error("Grant storage error: {message}")]
    Storage { message: String },

    #[error("Transaction error: {0}")]
    Tx(#[from] TxError),
}

impl GrantError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAmount { .. }
                | Self::InvalidRollover { .. }
                | Self::InvalidExpiration
                | Self::AlreadyVoided { .. }
        )
    }
}

pub type GrantResult<T> = std::result::Result<T, GrantError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_error_display() {
        let err = GrantError::NotFound {
            id: "grant-123".to_string(),
        };
        assert!(err.to_string().contains("grant-123"));
        assert!(!err.is_validation());
        assert!(GrantError::InvalidExpiration.is_validation());
    }
}
