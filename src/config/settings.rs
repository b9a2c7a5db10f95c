//! Typed settings of the balance orchestrator.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigError, ConfigResult};

pub const SNAPSHOT_GRACE_PERIOD_KEY: &str = "credit.snapshot_grace_period_secs";
pub const SNAPSHOTS_ENABLED_KEY: &str = "credit.snapshots_enabled";
pub const USAGE_GRANULARITY_KEY: &str = "credit.usage_granularity_secs";

const DEFAULT_GRACE_PERIOD_SECS: i64 = 3600;
/// Ten years.
const MAX_GRACE_PERIOD_SECS: i64 = 10 * 366 * 24 * 3600;
const USAGE_GRANULARITY_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSettings {
    /// Minimum age of a history breakpoint before it's saved as a snapshot.
    pub snapshot_grace_period_secs: i64,
    pub snapshots_enabled: bool,
    /// Only minute granularity is supported.
    pub usage_granularity_secs: i64,
}

impl Default for CreditSettings {
    fn default() -> Self {
        Self {
            snapshot_grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            snapshots_enabled: true,
            usage_granularity_secs: USAGE_GRANULARITY_SECS,
        }
    }
}

impl CreditSettings {
    pub async fn load(provider: &dyn ConfigProvider) -> ConfigResult<Self> {
        let defaults = Self::default();
        let settings = Self {
            snapshot_grace_period_secs: provider
                .get(SNAPSHOT_GRACE_PERIOD_KEY)
                .await?
                .unwrap_or(defaults.snapshot_grace_period_secs),
            snapshots_enabled: provider
                .get(SNAPSHOTS_ENABLED_KEY)
                .await?
                .unwrap_or(defaults.snapshots_enabled),
            usage_granularity_secs: provider
                .get(USAGE_GRANULARITY_KEY)
                .await?
                .unwrap_or(defaults.usage_granularity_secs),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        if !(0..=MAX_GRACE_PERIOD_SECS).contains(&self.snapshot_grace_period_secs) {
            errors.push(ConfigError::InvalidValue {
                key: SNAPSHOT_GRACE_PERIOD_KEY.to_string(),
                message: format!(
                    "must be between 0 and {MAX_GRACE_PERIOD_SECS}, got {}",
                    self.snapshot_grace_period_secs
                ),
            });
        }
        if self.usage_granularity_secs != USAGE_GRANULARITY_SECS {
            errors.push(ConfigError::InvalidValue {
                key: USAGE_GRANULARITY_KEY.to_string(),
                message: format!(
                    "only {USAGE_GRANULARITY_SECS}s is supported, got {}",
                    self.usage_granularity_secs
                ),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::ValidationErrors(super::ValidationErrors(errors))),
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.snapshot_grace_period_secs = grace.num_seconds();
        self
    }

    pub fn with_snapshots_enabled(mut self, enabled: bool) -> Self {
        self.snapshots_enabled = enabled;
        self
    }

    /// Clamped to the accepted range for settings that skipped `validate`.
    pub fn snapshot_grace_period(&self) -> Duration {
        Duration::seconds(
            self.snapshot_grace_period_secs
                .clamp(0, MAX_GRACE_PERIOD_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigProvider;

    #[tokio::test]
    async fn test_defaults_when_unset() {
        let settings = CreditSettings::load(&MemoryConfigProvider::new()).await.unwrap();
        assert_eq!(settings, CreditSettings::default());
        assert_eq!(settings.snapshot_grace_period(), Duration::hours(1));
    }

    #[tokio::test]
    async fn test_overrides_from_provider() {
        let provider = MemoryConfigProvider::with_values([
            (SNAPSHOT_GRACE_PERIOD_KEY, "0"),
            (SNAPSHOTS_ENABLED_KEY, "false"),
        ]);
        let settings = CreditSettings::load(&provider).await.unwrap();
        assert_eq!(settings.snapshot_grace_period_secs, 0);
        assert!(!settings.snapshots_enabled);
    }

    #[tokio::test]
    async fn test_rejects_unsupported_values() {
        let provider = MemoryConfigProvider::with_values([(USAGE_GRANULARITY_KEY, "1")]);
        let err = CreditSettings::load(&provider).await.unwrap_err();
        assert!(err.to_string().contains(USAGE_GRANULARITY_KEY));

        let both = CreditSettings {
            snapshot_grace_period_secs: -1,
            usage_granularity_secs: 30,
            ..Default::default()
        };
        assert!(matches!(
            both.validate(),
            Err(ConfigError::ValidationErrors(errors)) if errors.0.len() == 2
        ));
    }

    #[tokio::test]
    async fn test_rejects_unrepresentable_grace_period() {
        let provider =
            MemoryConfigProvider::with_values([(SNAPSHOT_GRACE_PERIOD_KEY, "9223372036854775807")]);
        let err = CreditSettings::load(&provider).await.unwrap_err();
        assert!(err.to_string().contains(SNAPSHOT_GRACE_PERIOD_KEY));

        let unchecked = CreditSettings {
            snapshot_grace_period_secs: i64::MAX,
            ..Default::default()
        };
        assert!(unchecked.validate().is_err());
        assert_eq!(
            unchecked.snapshot_grace_period(),
            Duration::seconds(MAX_GRACE_PERIOD_SECS)
        );
    }
}
