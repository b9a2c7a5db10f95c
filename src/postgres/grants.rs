use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::pg_connection;
use crate::grant::{Grant, GrantError, GrantId, GrantRepo, GrantResult, OwnerId};
use crate::tx::Transaction;

/// Grants stored as JSONB, with the columns needed for filtering kept beside.
pub struct PostgresGrantRepo {
    pool: Arc<PgPool>,
    table_name: String,
}

impl PostgresGrantRepo {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            table_name: "credit_grants".to_string(),
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
                id VARCHAR(255) PRIMARY KEY,
                seq BIGSERIAL,
                owner_id VARCHAR(255) NOT NULL,
                effective_at TIMESTAMPTZ NOT NULL,
                voided_at TIMESTAMPTZ,
                deleted_at TIMESTAMPTZ,
                data JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table} (owner_id, effective_at);
            "#,
            table = self.table_name
        );
        sqlx::raw_sql(&query).execute(&*self.pool).await?;
        Ok(())
    }

    async fn write(&self, tx: &mut dyn Transaction, grant: &Grant) -> GrantResult<()> {
        let data = serde_json::to_value(grant).map_err(storage)?;
        let query = format!(
            "UPDATE {} SET voided_at = $3, deleted_at = $4, data = $5 WHERE owner_id = $1 AND id = $2",
            self.table_name
        );
        sqlx::query(&query)
            .bind(grant.owner_id.as_str())
            .bind(grant.id.as_str())
            .bind(grant.voided_at)
            .bind(grant.deleted_at)
            .bind(&data)
            .execute(pg_connection(tx)?)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

fn storage(err: impl std::fmt::Display) -> GrantError {
    GrantError::Storage {
        message: err.to_string(),
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> GrantResult<Grant> {
    let data: serde_json::Value = row.try_get("data").map_err(storage)?;
    serde_json::from_value(data).map_err(storage)
}

#[async_trait]
impl GrantRepo for PostgresGrantRepo {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn create(&self, tx: &mut dyn Transaction, grant: &Grant) -> GrantResult<()> {
        let data = serde_json::to_value(grant).map_err(storage)?;
        let query = format!(
            r#"
            INSERT INTO {} (id, owner_id, effective_at, voided_at, deleted_at, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            self.table_name
        );
        sqlx::query(&query)
            .bind(grant.id.as_str())
            .bind(grant.owner_id.as_str())
            .bind(grant.effective_at)
            .bind(grant.voided_at)
            .bind(grant.deleted_at)
            .bind(&data)
            .execute(pg_connection(tx)?)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn list_active_between(
        &self,
        owner: &OwnerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GrantResult<Vec<Grant>> {
        let query = format!(
            "SELECT data FROM {} WHERE owner_id = $1 AND effective_at <= $2 ORDER BY seq",
            self.table_name
        );
        let rows = sqlx::query(&query)
            .bind(owner.as_str())
            .bind(to)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage)?;

        let mut grants = Vec::with_capacity(rows.len());
        for row in &rows {
            let grant = decode(row)?;
            if grant.active_between(from, to) {
                grants.push(grant);
            }
        }
        Ok(grants)
    }

    async fn get(&self, owner: &OwnerId, id: &GrantId) -> GrantResult<Grant> {
        let query = format!(
            "SELECT data FROM {} WHERE owner_id = $1 AND id = $2",
            self.table_name
        );
        let row = sqlx::query(&query)
            .bind(owner.as_str())
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => decode(&row),
            None => Err(GrantError::NotFound { id: id.to_string() }),
        }
    }

    async fn void(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        id: &GrantId,
        at: DateTime<Utc>,
    ) -> GrantResult<()> {
        let grant = self.get(owner, id).await?;
        if grant.voided_at.is_some() {
            return Err(GrantError::AlreadyVoided { id: id.to_string() });
        }
        self.write(tx, &grant.voided(at)).await
    }

    async fn delete_all_for_owner(
        &self,
        tx: &mut dyn Transaction,
        owner: &OwnerId,
        at: DateTime<Utc>,
    ) -> GrantResult<usize> {
        let query = format!(
            "SELECT data FROM {} WHERE owner_id = $1 AND deleted_at IS NULL",
            self.table_name
        );
        let rows = sqlx::query(&query)
            .bind(owner.as_str())
            .fetch_all(pg_connection(tx)?)
            .await
            .map_err(storage)?;

        for row in &rows {
            let grant = decode(row)?.deleted(at);
            self.write(tx, &grant).await?;
        }
        Ok(rows.len())
    }
}
