use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};

use super::pg_connection;
use crate::grant::OwnerId;
use crate::snapshot::{Snapshot, SnapshotError, SnapshotRepo, SnapshotResult};
use crate::tx::Transaction;

/// Balance snapshots stored as JSONB; invalidation is a soft flag.
pub struct PostgresSnapshotRepo {
    pool: Arc<PgPool>,
    table_name: String,
}

impl PostgresSnapshotRepo {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            table_name: "credit_balance_snapshots".to_string(),
        }
    }

    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                owner_id VARCHAR(255) NOT NULL,
                at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                invalidated_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_owner_at ON {table} (owner_id, at);
            "#,
            table = self.table_name
        );
        sqlx::raw_sql(&query).execute(&*self.pool).await?;
        Ok(())
    }

    async fn insert_all(
        &self,
        conn: &mut PgConnection,
        owner: &OwnerId,
        snapshots: &[Snapshot],
    ) -> SnapshotResult<()> {
        let query = format!(
            "INSERT INTO {} (owner_id, at, data) VALUES ($1, $2, $3)",
            self.table_name
        );
        for snapshot in snapshots {
            let data = serde_json::to_value(snapshot)?;
            sqlx::query(&query)
                .bind(owner.as_str())
                .bind(snapshot.at)
                .bind(&data)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }
        Ok(())
    }
}

fn storage(err: sqlx::Error) -> SnapshotError {
    SnapshotError::Storage {
        message: err.to_string(),
    }
}

#[async_trait]
impl SnapshotRepo for PostgresSnapshotRepo {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn invalidate_after(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> SnapshotResult<usize> {
        let query = format!(
            "UPDATE {} SET invalidated_at = NOW() WHERE owner_id = $1 AND at >= $2 AND invalidated_at IS NULL",
            self.table_name
        );
        let result = sqlx::query(&query)
            .bind(owner.as_str())
            .bind(at)
            .execute(pg_connection(tx)?)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_latest_valid_at(
        &self,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> SnapshotResult<Snapshot> {
        let query = format!(
            r#"
            SELECT data FROM {} WHERE owner_id = $1 AND at <= $2 AND invalidated_at IS NULL
            ORDER BY at DESC, id DESC LIMIT 1
            "#,
            self.table_name
        );
        let row = sqlx::query(&query)
            .bind(owner.as_str())
            .bind(at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data").map_err(storage)?;
                Ok(serde_json::from_value(data)?)
            }
            None => Err(SnapshotError::NotFound {
                owner: owner.to_string(),
                at,
            }),
        }
    }

    async fn save(
        &self,
        tx: Option<&mut dyn Transaction>,
        owner: &OwnerId,
        snapshots: &[Snapshot],
    ) -> SnapshotResult<()> {
        match tx {
            Some(tx) => self.insert_all(pg_connection(tx)?, owner, snapshots).await,
            None => {
                let mut own = self.pool.begin().await.map_err(storage)?;
                self.insert_all(&mut own, owner, snapshots).await?;
                own.commit().await.map_err(storage)
            }
        }
    }
}
