//! Read-only configuration from environment variables.
//!
//! `credit.snapshot_grace_period_secs` maps to
//! `{PREFIX}CREDIT_SNAPSHOT_GRACE_PERIOD_SECS`. Only the dots are
//! translated, so listing keys maps every `_` back to a dot.

use super::provider::ConfigProvider;
use super::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default)]
pub struct EnvConfigProvider {
    prefix: String,
}

impl EnvConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.replace('.', "_").to_uppercase())
    }

    fn key_name(&self, var: &str) -> Option<String> {
        var.strip_prefix(self.prefix.as_str())
            .map(|rest| rest.replace('_', ".").to_lowercase())
    }

    fn read_only(&self) -> ConfigError {
        ConfigError::Provider {
            message: format!("{} provider is read-only", self.name()),
        }
    }
}

#[async_trait::async_trait]
impl ConfigProvider for EnvConfigProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        match std::env::var(self.var_name(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_raw(&self, _key: &str, _value: &str) -> ConfigResult<()> {
        Err(self.read_only())
    }

    async fn delete(&self, _key: &str) -> ConfigResult<bool> {
        Err(self.read_only())
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let var_prefix = self.var_name(prefix);
        Ok(std::env::vars()
            .map(|(var, _)| var)
            .filter(|var| var.starts_with(&var_prefix))
            .filter_map(|var| self.key_name(&var))
            .collect())
    }
}
