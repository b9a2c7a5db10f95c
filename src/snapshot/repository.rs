//! Snapshot storage.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::RwLock;

use super::{Snapshot, SnapshotError, SnapshotResult};
use crate::grant::OwnerId;
use crate::tx::Transaction;

#[async_trait::async_trait]
pub trait SnapshotRepo: Send + Sync {
    fn name(&self) -> &str;

    /// Soft-invalidates every snapshot of `owner` taken at or after `at`.
    async fn invalidate_after(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> SnapshotResult<usize>;

    /// The latest valid snapshot taken at or before `at`.
    async fn get_latest_valid_at(
        &self,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> SnapshotResult<Snapshot>;

    async fn save(
        &self,
        tx: Option<&mut dyn Transaction>,
        owner: &OwnerId,
        snapshots: &[Snapshot],
    ) -> SnapshotResult<()>;
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    snapshot: Snapshot,
    invalidated: bool,
}

type SnapshotStore = Arc<RwLock<HashMap<OwnerId, Vec<StoredSnapshot>>>>;

/// In-memory snapshot storage (for testing and single-instance deployments)
#[derive(Debug, Default, Clone)]
pub struct MemorySnapshotRepo {
    snapshots: SnapshotStore,
}

impl MemorySnapshotRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valid snapshots of `owner`, oldest first.
    pub async fn valid_snapshots(&self, owner: &OwnerId) -> Vec<Snapshot> {
        let store = self.snapshots.read().await;
        let mut snapshots: Vec<Snapshot> = store
            .get(owner)
            .map(|list| {
                list.iter()
                    .filter(|s| !s.invalidated)
                    .map(|s| s.snapshot.clone())
                    .collect()
            })
            .unwrap_or_default();
        snapshots.sort_by_key(|s| s.at);
        snapshots
    }

    /// Number of stored snapshots, invalidated ones included.
    pub async fn count(&self, owner: &OwnerId) -> usize {
        self.snapshots.read().await.get(owner).map_or(0, Vec::len)
    }
}

#[async_trait::async_trait]
impl SnapshotRepo for MemorySnapshotRepo {
    fn name(&self) -> &str {
        "memory"
    }

    async fn invalidate_after(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> SnapshotResult<usize> {
        let touched: Vec<usize> = {
            let mut store = self.snapshots.write().await;
            let Some(list) = store.get_mut(owner) else {
                return Ok(0);
            };
            list.iter_mut()
                .enumerate()
                .filter(|(_, s)| !s.invalidated && s.snapshot.at >= at)
                .map(|(idx, s)| {
                    s.invalidated = true;
                    idx
                })
                .collect()
        };

        let count = touched.len();
        let store = Arc::clone(&self.snapshots);
        let owner = owner.clone();
        tx.register_rollback(Box::new(move || {
            async move {
                if let Some(list) = store.write().await.get_mut(&owner) {
                    for idx in touched {
                        if let Some(s) = list.get_mut(idx) {
                            s.invalidated = false;
                        }
                    }
                }
            }
            .boxed()
        }));
        Ok(count)
    }

    async fn get_latest_valid_at(
        &self,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> SnapshotResult<Snapshot> {
        let store = self.snapshots.read().await;
        store
            .get(owner)
            .and_then(|list| {
                list.iter()
                    .filter(|s| !s.invalidated && s.snapshot.at <= at)
                    .max_by_key(|s| s.snapshot.at)
            })
            .map(|s| s.snapshot.clone())
            .ok_or_else(|| SnapshotError::NotFound {
                owner: owner.to_string(),
                at,
            })
    }

    async fn save(
        &self,
        tx: Option<&mut dyn Transaction>,
        owner: &OwnerId,
        snapshots: &[Snapshot],
    ) -> SnapshotResult<()> {
        let first_new = {
            let mut store = self.snapshots.write().await;
            let list = store.entry(owner.clone()).or_default();
            let first_new = list.len();
            list.extend(snapshots.iter().cloned().map(|snapshot| StoredSnapshot {
                snapshot,
                invalidated: false,
            }));
            first_new
        };

        if let Some(tx) = tx {
            let store = Arc::clone(&self.snapshots);
            let owner = owner.clone();
            tx.register_rollback(Box::new(move || {
                async move {
                    if let Some(list) = store.write().await.get_mut(&owner) {
                        list.truncate(first_new);
                    }
                }
                .boxed()
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshottedUsage;
    use crate::tx::{MemoryTransactionManager, TransactionManager};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn snapshot_at(at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            balances: Default::default(),
            overage: dec!(0),
            usage: SnapshottedUsage::zero_since(t0()),
            at,
        }
    }

    #[tokio::test]
    async fn test_latest_valid_at() {
        let repo = MemorySnapshotRepo::new();
        let owner = OwnerId::new("owner");
        repo.save(
            None,
            &owner,
            &[
                snapshot_at(t0() + Duration::hours(1)),
                snapshot_at(t0() + Duration::hours(3)),
            ],
        )
        .await
        .unwrap();

        let found = repo
            .get_latest_valid_at(&owner, t0() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(found.at, t0() + Duration::hours(1));

        let err = repo.get_latest_valid_at(&owner, t0()).await.unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalidate_after_is_inclusive_and_soft() {
        let repo = MemorySnapshotRepo::new();
        let txm = MemoryTransactionManager::new();
        let owner = OwnerId::new("owner");
        repo.save(
            None,
            &owner,
            &[
                snapshot_at(t0() + Duration::hours(1)),
                snapshot_at(t0() + Duration::hours(2)),
            ],
        )
        .await
        .unwrap();

        let mut tx = txm.begin().await.unwrap();
        let invalidated = repo
            .invalidate_after(tx.as_mut(), &owner, t0() + Duration::hours(1))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(invalidated, 2);
        assert_eq!(repo.count(&owner).await, 2);
        assert!(repo.valid_snapshots(&owner).await.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restores_invalidated_and_drops_saved() {
        let repo = MemorySnapshotRepo::new();
        let txm = MemoryTransactionManager::new();
        let owner = OwnerId::new("owner");
        repo.save(None, &owner, &[snapshot_at(t0() + Duration::hours(1))])
            .await
            .unwrap();

        let mut tx = txm.begin().await.unwrap();
        repo.invalidate_after(tx.as_mut(), &owner, t0())
            .await
            .unwrap();
        repo.save(Some(tx.as_mut()), &owner, &[snapshot_at(t0() + Duration::hours(5))])
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let valid = repo.valid_snapshots(&owner).await;
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].at, t0() + Duration::hours(1));
    }
}
