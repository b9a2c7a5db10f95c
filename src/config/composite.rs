//! Layered configuration: the first provider holding a key wins.

use std::collections::BTreeSet;

use super::ConfigResult;
use super::provider::ConfigProvider;

#[derive(Default)]
pub struct CompositeConfigProvider {
    layers: Vec<Box<dyn ConfigProvider>>,
}

impl CompositeConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer below the existing ones.
    pub fn push(&mut self, provider: Box<dyn ConfigProvider>) {
        self.layers.push(provider);
    }

    pub fn layer(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.push(provider);
        self
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|p| p.name()).collect()
    }
}

impl std::fmt::Debug for CompositeConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeConfigProvider")
            .field("layers", &self.layer_names())
            .finish()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for CompositeConfigProvider {
    fn name(&self) -> &str {
        "composite"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        for layer in &self.layers {
            if let Some(value) = layer.get_raw(key).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Writes go to the top layer.
    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()> {
        match self.layers.first() {
            Some(top) => top.set_raw(key, value).await,
            None => Ok(()),
        }
    }

    async fn delete(&self, key: &str) -> ConfigResult<bool> {
        let mut existed = false;
        for layer in &self.layers {
            existed |= layer.delete(key).await?;
        }
        Ok(existed)
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let mut keys = BTreeSet::new();
        for layer in &self.layers {
            keys.extend(layer.list_keys(prefix).await?);
        }
        Ok(keys.into_iter().collect())
    }
}
