//! Domain events emitted by balance-affecting mutations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::grant::{Grant, OwnerId};
use crate::tx::Transaction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    GrantCreated {
        owner: OwnerId,
        grant: Grant,
    },
    GrantVoided {
        owner: OwnerId,
        grant: Grant,
    },
    UsageReset {
        owner: OwnerId,
        at: DateTime<Utc>,
        retain_anchor: bool,
        preserve_overage: bool,
    },
}

impl DomainEvent {
    pub fn owner(&self) -> &OwnerId {
        match self {
            Self::GrantCreated { owner, .. }
            | Self::GrantVoided { owner, .. }
            | Self::UsageReset { owner, .. } => owner,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::GrantCreated { .. } => "grant_created",
            Self::GrantVoided { .. } => "grant_voided",
            Self::UsageReset { .. } => "usage_reset",
        }
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to publish {kind} event: {message}")]
    Publish { kind: &'static str, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EventResult<T> = std::result::Result<T, EventError>;

/// Publishes events as part of a transaction; a rolled back transaction
/// must not leave its events behind.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, tx: &mut dyn Transaction, event: DomainEvent) -> EventResult<()>;
}

/// Collects events in memory (for testing and single-instance deployments)
#[derive(Debug, Default, Clone)]
pub struct MemoryEventPublisher {
    events: Arc<RwLock<Vec<(Uuid, DomainEvent)>>>,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<DomainEvent> {
        self.events
            .read()
            .await
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl EventPublisher for MemoryEventPublisher {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, tx: &mut dyn Transaction, event: DomainEvent) -> EventResult<()> {
        let id = Uuid::new_v4();
        self.events.write().await.push((id, event));

        let events = Arc::clone(&self.events);
        tx.register_rollback(Box::new(move || {
            async move {
                events.write().await.retain(|(published, _)| *published != id);
            }
            .boxed()
        }));
        Ok(())
    }
}
