//! Transactions with per-owner row locks.
//!
//! Mutating repository calls take a `&mut dyn Transaction`. Backends that
//! cannot roll back natively register compensating actions with
//! [`Transaction::register_rollback`]; they run in reverse order when the
//! transaction is rolled back.

mod memory;

pub use memory::{MemoryTransaction, MemoryTransactionManager};

use std::any::Any;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::grant::OwnerId;

pub type RollbackAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Error, Debug)]
pub enum TxError {
    #[error("Failed to lock owner {owner}: {message}")]
    Lock { owner: String, message: String },

    #[error("Transaction backend mismatch: expected {expected}")]
    BackendMismatch { expected: &'static str },

    #[error("Transaction storage error: {message}")]
    Storage { message: String },
}

pub type TxResult<T> = std::result::Result<T, TxError>;

#[async_trait::async_trait]
pub trait Transaction: Send {
    /// Takes the row lock for `owner` until the transaction finishes.
    /// Locking the same owner twice is a no-op.
    async fn lock_owner(&mut self, owner: &OwnerId) -> TxResult<()>;

    fn register_rollback(&mut self, action: RollbackAction);

    /// Backend access for repositories that need the concrete transaction.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    async fn commit(self: Box<Self>) -> TxResult<()>;

    async fn rollback(self: Box<Self>) -> TxResult<()>;
}

#[async_trait::async_trait]
pub trait TransactionManager: Send + Sync {
    fn name(&self) -> &str;

    async fn begin(&self) -> TxResult<Box<dyn Transaction>>;
}
