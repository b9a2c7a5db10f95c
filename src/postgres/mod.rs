//! PostgreSQL backends for grants, snapshots and owner-locked transactions.
//!
//! Enable with the `postgres` feature flag. Repositories expect the
//! transaction handed to them to come from [`PgTransactionManager`].

mod grants;
mod snapshots;

pub use grants::PostgresGrantRepo;
pub use snapshots::PostgresSnapshotRepo;

use std::any::Any;
use std::sync::Arc;

use sqlx::{PgConnection, PgPool, Postgres};

use crate::grant::OwnerId;
use crate::tx::{RollbackAction, Transaction, TransactionManager, TxError, TxResult};

/// Opens database transactions that lock owners with
/// transaction-scoped advisory locks.
#[derive(Debug, Clone)]
pub struct PgTransactionManager {
    pool: Arc<PgPool>,
}

impl PgTransactionManager {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TransactionManager for PgTransactionManager {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn begin(&self) -> TxResult<Box<dyn Transaction>> {
        let inner = self.pool.begin().await.map_err(tx_storage)?;
        Ok(Box::new(PgTransaction {
            inner: Some(inner),
            held: Vec::new(),
            rollbacks: Vec::new(),
        }))
    }
}

pub struct PgTransaction {
    inner: Option<sqlx::Transaction<'static, Postgres>>,
    held: Vec<OwnerId>,
    /// Compensations registered by non-database repositories sharing the tx.
    rollbacks: Vec<RollbackAction>,
}

impl PgTransaction {
    pub fn connection(&mut self) -> TxResult<&mut PgConnection> {
        self.inner.as_deref_mut().ok_or_else(|| TxError::Storage {
            message: "transaction already finished".to_string(),
        })
    }
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction")
            .field("open", &self.inner.is_some())
            .field("held", &self.held)
            .field("pending_rollbacks", &self.rollbacks.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl Transaction for PgTransaction {
    async fn lock_owner(&mut self, owner: &OwnerId) -> TxResult<()> {
        if self.held.contains(owner) {
            return Ok(());
        }
        let conn = self.connection()?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(owner.as_str())
            .execute(conn)
            .await
            .map_err(|e| TxError::Lock {
                owner: owner.to_string(),
                message: e.to_string(),
            })?;
        self.held.push(owner.clone());
        Ok(())
    }

    fn register_rollback(&mut self, action: RollbackAction) {
        self.rollbacks.push(action);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn commit(self: Box<Self>) -> TxResult<()> {
        let mut this = self;
        if let Some(inner) = this.inner.take() {
            inner.commit().await.map_err(tx_storage)?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> TxResult<()> {
        let mut this = self;
        let result = match this.inner.take() {
            Some(inner) => inner.rollback().await.map_err(tx_storage),
            None => Ok(()),
        };
        while let Some(action) = this.rollbacks.pop() {
            action().await;
        }
        result
    }
}

/// The database connection behind `tx`.
pub(crate) fn pg_connection(tx: &mut dyn Transaction) -> TxResult<&mut PgConnection> {
    tx.as_any_mut()
        .downcast_mut::<PgTransaction>()
        .ok_or(TxError::BackendMismatch {
            expected: "postgres",
        })?
        .connection()
}

fn tx_storage(err: sqlx::Error) -> TxError {
    TxError::Storage {
        message: err.to_string(),
    }
}

/// Creates the grant and snapshot tables with their default names.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    let pool = Arc::new(pool.clone());
    PostgresGrantRepo::with_pool(Arc::clone(&pool))
        .migrate()
        .await?;
    PostgresSnapshotRepo::with_pool(pool).migrate().await
}
