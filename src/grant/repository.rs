//! Grant storage.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::RwLock;

use super::ids::{GrantId, OwnerId};
use super::model::Grant;
use super::{GrantError, GrantResult};
use crate::tx::Transaction;

#[async_trait::async_trait]
pub trait GrantRepo: Send + Sync {
    fn name(&self) -> &str;

    async fn create(&self, tx: &mut dyn Transaction, grant: &Grant) -> GrantResult<()>;

    /// Grants active at any instant of `[from, to]`, voided and deleted ones
    /// included, in creation order.
    async fn list_active_between(
        &self,
        owner: &OwnerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GrantResult<Vec<Grant>>;

    async fn get(&self, owner: &OwnerId, id: &GrantId) -> GrantResult<Grant>;

    async fn void(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        id: &GrantId,
        at: DateTime<Utc>,
    ) -> GrantResult<()>;

    /// Soft-deletes every grant of `owner` that isn't deleted yet.
    async fn delete_all_for_owner(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> GrantResult<usize>;
}

type GrantStore = Arc<RwLock<HashMap<OwnerId, Vec<Grant>>>>;

/// In-memory grant storage (for testing and single-instance deployments)
#[derive(Debug, Default, Clone)]
pub struct MemoryGrantRepo {
    grants: GrantStore,
}

impl MemoryGrantRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of grants stored for `owner`.
    pub async fn count(&self, owner: &OwnerId) -> usize {
        self.grants.read().await.get(owner).map_or(0, Vec::len)
    }

    async fn replace(store: GrantStore, grant: Grant) {
        let mut grants = store.write().await;
        if let Some(slot) = grants
            .get_mut(&grant.owner_id)
            .and_then(|list| list.iter_mut().find(|g| g.id == grant.id))
        {
            *slot = grant;
        }
    }
}

#[async_trait::async_trait]
impl GrantRepo for MemoryGrantRepo {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, tx: &mut dyn Transaction, grant: &Grant) -> GrantResult<()> {
        {
            let mut grants = self.grants.write().await;
            grants
                .entry(grant.owner_id.clone())
                .or_default()
                .push(grant.clone());
        }

        let store = Arc::clone(&self.grants);
        let owner = grant.owner_id.clone();
        let id = grant.id.clone();
        tx.register_rollback(Box::new(move || {
            async move {
                if let Some(list) = store.write().await.get_mut(&owner) {
                    list.retain(|g| g.id != id);
                }
            }
            .boxed()
        }));
        Ok(())
    }

    async fn list_active_between(
        &self,
        owner: &OwnerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GrantResult<Vec<Grant>> {
        let grants = self.grants.read().await;
        Ok(grants
            .get(owner)
            .map(|list| {
                list.iter()
                    .filter(|g| g.active_between(from, to))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, owner: &OwnerId, id: &GrantId) -> GrantResult<Grant> {
        let grants = self.grants.read().await;
        grants
            .get(owner)
            .and_then(|list| list.iter().find(|g| &g.id == id))
            .cloned()
            .ok_or_else(|| GrantError::NotFound { id: id.to_string() })
    }

    async fn void(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        id: &GrantId,
        at: DateTime<Utc>,
    ) -> GrantResult<()> {
        let previous = {
            let mut grants = self.grants.write().await;
            let grant = grants
                .get_mut(owner)
                .and_then(|list| list.iter_mut().find(|g| &g.id == id))
                .ok_or_else(|| GrantError::NotFound { id: id.to_string() })?;
            if grant.voided_at.is_some() {
                return Err(GrantError::AlreadyVoided { id: id.to_string() });
            }
            let previous = grant.clone();
            grant.voided_at = Some(at);
            previous
        };

        let store = Arc::clone(&self.grants);
        tx.register_rollback(Box::new(move || Self::replace(store, previous).boxed()));
        Ok(())
    }

    async fn delete_all_for_owner(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> GrantResult<usize> {
        let previous: Vec<Grant> = {
            let mut grants = self.grants.write().await;
            let Some(list) = grants.get_mut(owner) else {
                return Ok(0);
            };
            list.iter_mut()
                .filter(|g| g.deleted_at.is_none())
                .map(|g| {
                    let previous = g.clone();
                    g.deleted_at = Some(at);
                    previous
                })
                .collect()
        };

        let deleted = previous.len();
        let store = Arc::clone(&self.grants);
        tx.register_rollback(Box::new(move || {
            async move {
                for grant in previous {
                    Self::replace(Arc::clone(&store), grant).await;
                }
            }
            .boxed()
        }));
        Ok(deleted)
    }
}
