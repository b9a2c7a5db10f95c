//! Configuration provider trait.

use serde::{Serialize, de::DeserializeOwned};

use super::{ConfigError, ConfigResult};

/// A source of string-valued settings addressed by dotted keys
/// (`credit.snapshot_grace_period_secs`).
#[async_trait::async_trait]
pub trait ConfigProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>>;

    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> ConfigResult<bool>;

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>>;
}

/// Typed access; values are stored as JSON.
pub trait ConfigProviderExt: ConfigProvider {
    fn get<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        Self: Sync,
    {
        async move {
            let Some(raw) = self.get_raw(key).await? else {
                return Ok(None);
            };
            serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
    }

    fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> impl std::future::Future<Output = ConfigResult<()>> + Send
    where
        Self: Sync,
    {
        async move { self.set_raw(key, &serde_json::to_string(value)?).await }
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {}
