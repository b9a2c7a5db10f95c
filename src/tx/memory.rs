//! In-process transactions for tests and single-instance deployments.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{RollbackAction, Transaction, TransactionManager, TxResult};
use crate::grant::OwnerId;

#[derive(Debug, Clone, Default)]
pub struct MemoryTransactionManager {
    locks: Arc<DashMap<OwnerId, Arc<Mutex<()>>>>,
}

impl MemoryTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether some transaction currently holds the lock for `owner`.
    pub fn is_locked(&self, owner: &OwnerId) -> bool {
        self.locks
            .get(owner)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl TransactionManager for MemoryTransactionManager {
    fn name(&self) -> &str {
        "memory"
    }

    async fn begin(&self) -> TxResult<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            locks: Arc::clone(&self.locks),
            held: HashSet::new(),
            guards: Vec::new(),
            rollbacks: Vec::new(),
        }))
    }
}

pub struct MemoryTransaction {
    locks: Arc<DashMap<OwnerId, Arc<Mutex<()>>>>,
    held: HashSet<OwnerId>,
    guards: Vec<OwnedMutexGuard<()>>,
    rollbacks: Vec<RollbackAction>,
}

impl std::fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("held", &self.held)
            .field("pending_rollbacks", &self.rollbacks.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl Transaction for MemoryTransaction {
    async fn lock_owner(&mut self, owner: &OwnerId) -> TxResult<()> {
        if self.held.contains(owner) {
            return Ok(());
        }
        // Clone the mutex out so the map shard isn't held across the await.
        let mutex = Arc::clone(&self.locks.entry(owner.clone()).or_default());
        let guard = mutex.lock_owned().await;
        self.guards.push(guard);
        self.held.insert(owner.clone());
        Ok(())
    }

    fn register_rollback(&mut self, action: RollbackAction) {
        self.rollbacks.push(action);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn commit(self: Box<Self>) -> TxResult<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> TxResult<()> {
        let mut this = self;
        while let Some(action) = this.rollbacks.pop() {
            action().await;
        }
        Ok(())
    }
}
