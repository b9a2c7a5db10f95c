//! The immutable grant definition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids::{GrantId, OwnerId};
use super::{GrantError, GrantResult};
use crate::timeutil::{OpenPeriod, Recurrence, RecurrenceInterval, truncate_to_minute};

pub const DEFAULT_PRIORITY: u8 = 1;

/// Relative expiration, resolved against `effective_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationPeriod {
    pub duration: RecurrenceInterval,
    pub count: u32,
}

impl ExpirationPeriod {
    pub fn new(duration: RecurrenceInterval, count: u32) -> Self {
        Self { duration, count }
    }

    pub fn expires_at(&self, effective_at: DateTime<Utc>) -> GrantResult<DateTime<Utc>> {
        Ok(Recurrence::new(self.duration, effective_at).iteration(i64::from(self.count))?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub id: GrantId,
    pub owner_id: OwnerId,
    pub amount: Decimal,
    /// Lower values are burnt first.
    pub priority: u8,
    pub effective_at: DateTime<Utc>,
    pub expiration: Option<ExpirationPeriod>,
    /// Exclusive.
    pub expires_at: Option<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,
    pub reset_min_rollover: Decimal,
    pub reset_max_rollover: Decimal,
    pub voided_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Grant {
    pub fn new(
        id: impl Into<GrantId>,
        owner_id: impl Into<OwnerId>,
        amount: Decimal,
        effective_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            amount,
            priority: DEFAULT_PRIORITY,
            effective_at,
            expiration: None,
            expires_at: None,
            recurrence: None,
            reset_min_rollover: Decimal::ZERO,
            reset_max_rollover: Decimal::ZERO,
            voided_at: None,
            deleted_at: None,
            created_at: effective_at,
            metadata: BTreeMap::new(),
        }
    }

    /// Builds a grant from a creation request, aligning it to the minute.
    pub fn from_input(
        owner_id: OwnerId,
        input: GrantInput,
        created_at: DateTime<Utc>,
    ) -> GrantResult<Self> {
        input.validate()?;

        let effective_at = truncate_to_minute(input.effective_at);
        let expires_at = input
            .expiration
            .map(|e| e.expires_at(effective_at))
            .transpose()?;
        let recurrence = input.recurrence.map(|interval| {
            Recurrence::new(interval, input.recurrence_anchor.unwrap_or(effective_at))
        });

        Ok(Self {
            id: GrantId::new(),
            owner_id,
            amount: input.amount,
            priority: input.priority,
            effective_at,
            expiration: input.expiration,
            expires_at,
            recurrence,
            reset_min_rollover: input.reset_min_rollover,
            reset_max_rollover: input.reset_max_rollover.unwrap_or(Decimal::ZERO),
            voided_at: None,
            deleted_at: None,
            created_at,
            metadata: input.metadata,
        })
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_expiration(mut self, expiration: ExpirationPeriod) -> GrantResult<Self> {
        self.expires_at = Some(expiration.expires_at(self.effective_at)?);
        self.expiration = Some(expiration);
        Ok(self)
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_rollover(mut self, min: Decimal, max: Decimal) -> Self {
        self.reset_min_rollover = min;
        self.reset_max_rollover = max;
        self
    }

    pub fn voided(mut self, at: DateTime<Utc>) -> Self {
        self.voided_at = Some(at);
        self
    }

    pub fn deleted(mut self, at: DateTime<Utc>) -> Self {
        self.deleted_at = Some(at);
        self
    }

    /// `[effective_at, min(expires_at, deleted_at, voided_at))`, collapsed to
    /// an empty period at `effective_at` when any end precedes the start.
    pub fn effective_period(&self) -> OpenPeriod {
        let end = [self.expires_at, self.deleted_at, self.voided_at]
            .into_iter()
            .flatten()
            .min()
            .map(|end| end.max(self.effective_at));

        OpenPeriod {
            from: Some(self.effective_at),
            to: end,
        }
    }

    pub fn active_at(&self, t: DateTime<Utc>) -> bool {
        self.effective_period().contains(t)
    }

    /// Whether the grant is active at any instant of `[from, to]`.
    pub fn active_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        let period = self.effective_period();
        let start = self.effective_at;
        let end = period.to;
        if end.is_some_and(|end| end <= start) {
            return false;
        }
        start <= to && end.is_none_or(|end| from < end)
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Balance carried across a usage reset: `min` is applied first, so a
    /// `max` below `min` wins.
    pub fn rollover_balance(&self, ending_balance: Decimal) -> Decimal {
        ending_balance
            .max(self.reset_min_rollover)
            .min(self.reset_max_rollover)
    }

    /// Balance after a recurrence; recurring grants always refill to `amount`.
    pub fn recurrence_balance(&self, _current_balance: Decimal) -> Decimal {
        self.amount
    }
}

/// Request to create a grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantInput {
    pub amount: Decimal,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub effective_at: DateTime<Utc>,
    pub expiration: Option<ExpirationPeriod>,
    pub recurrence: Option<RecurrenceInterval>,
    pub recurrence_anchor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reset_min_rollover: Decimal,
    pub reset_max_rollover: Option<Decimal>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl GrantInput {
    pub fn new(amount: Decimal, effective_at: DateTime<Utc>) -> Self {
        Self {
            amount,
            priority: DEFAULT_PRIORITY,
            effective_at,
            expiration: None,
            recurrence: None,
            recurrence_anchor: None,
            reset_min_rollover: Decimal::ZERO,
            reset_max_rollover: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn expiration(mut self, expiration: ExpirationPeriod) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn recurrence(mut self, interval: RecurrenceInterval) -> Self {
        self.recurrence = Some(interval);
        self
    }

    pub fn rollover(mut self, min: Decimal, max: Decimal) -> Self {
        self.reset_min_rollover = min;
        self.reset_max_rollover = Some(max);
        self
    }

    pub fn validate(&self) -> GrantResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(GrantError::InvalidAmount {
                amount: self.amount,
            });
        }
        let max = self.reset_max_rollover.unwrap_or(Decimal::ZERO);
        if self.reset_min_rollover < Decimal::ZERO || max < Decimal::ZERO {
            return Err(GrantError::InvalidRollover {
                message: "rollover bounds must not be negative".into(),
            });
        }
        if self.reset_min_rollover > max {
            return Err(GrantError::InvalidRollover {
                message: format!(
                    "min rollover {} exceeds max rollover {}",
                    self.reset_min_rollover, max
                ),
            });
        }
        if self.expiration.is_some_and(|e| e.count == 0) {
            return Err(GrantError::InvalidExpiration);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_active_at_is_start_inclusive_end_exclusive() {
        let grant = Grant::new("g1", "owner", dec!(100), t0()).with_expires_at(t0() + Duration::days(1));
        assert!(grant.active_at(t0()));
        assert!(!grant.active_at(t0() - Duration::minutes(1)));
        assert!(grant.active_at(t0() + Duration::hours(23)));
        assert!(!grant.active_at(t0() + Duration::days(1)));
    }

    #[test]
    fn test_earliest_truncating_bound_wins() {
        let grant = Grant::new("g1", "owner", dec!(100), t0())
            .with_expires_at(t0() + Duration::days(10))
            .voided(t0() + Duration::days(3))
            .deleted(t0() + Duration::days(5));
        assert_eq!(grant.effective_period().to, Some(t0() + Duration::days(3)));
        assert!(!grant.active_at(t0() + Duration::days(4)));
    }

    #[test]
    fn test_void_before_effective_never_activates() {
        let grant = Grant::new("g1", "owner", dec!(100), t0()).voided(t0() - Duration::hours(1));
        let period = grant.effective_period();
        assert_eq!(period.from, period.to);
        assert!(!grant.active_at(t0()));
        assert!(!grant.active_between(t0() - Duration::days(1), t0() + Duration::days(1)));
    }

    #[test]
    fn test_rollover_balance_clamps() {
        let grant = Grant::new("g1", "owner", dec!(100), t0()).with_rollover(dec!(10), dec!(50));
        assert_eq!(grant.rollover_balance(dec!(80)), dec!(50));
        assert_eq!(grant.rollover_balance(dec!(5)), dec!(10));
        assert_eq!(grant.rollover_balance(dec!(30)), dec!(30));
        assert_eq!(grant.recurrence_balance(dec!(3)), dec!(100));
    }

    #[test]
    fn test_from_input_resolves_expiration_and_anchor() {
        let effective = t0() + Duration::seconds(42);
        let input = GrantInput::new(dec!(25), effective)
            .expiration(ExpirationPeriod::new(RecurrenceInterval::Day, 7))
            .recurrence(RecurrenceInterval::Day);
        let grant = Grant::from_input(OwnerId::new("owner"), input, t0()).unwrap();

        assert_eq!(grant.effective_at, t0());
        assert_eq!(grant.expires_at, Some(t0() + Duration::days(7)));
        assert_eq!(grant.recurrence.map(|r| r.anchor), Some(t0()));
    }

    #[test]
    fn test_input_validation() {
        assert!(matches!(
            GrantInput::new(dec!(0), t0()).validate(),
            Err(GrantError::InvalidAmount { .. })
        ));
        assert!(matches!(
            GrantInput::new(dec!(10), t0()).rollover(dec!(5), dec!(1)).validate(),
            Err(GrantError::InvalidRollover { .. })
        ));
        assert!(GrantInput::new(dec!(10), t0()).rollover(dec!(0), dec!(10)).validate().is_ok());
    }
}
