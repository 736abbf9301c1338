//! PostgreSQL adapter.
//!
//! Claims run as one statement: the inner `SELECT ... FOR UPDATE SKIP LOCKED` locks the
//! rows it picks and skips rows another claim already holds, and the outer `UPDATE`
//! leases them in the same atomic unit.

use futures_util::{future::BoxFuture, FutureExt};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};

use super::{Backend, INSERT_CHUNK};
use crate::{
    engine::BackendKind,
    error::Result,
    message::{MessageRow, PendingRow, COLUMNS},
    queue::QueueName,
};

const KIND: BackendKind = BackendKind::Postgres;

#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_chunks(
        conn: &mut PgConnection,
        table: &str,
        mut rows: Vec<PendingRow>,
    ) -> Result<()> {
        while !rows.is_empty() {
            let chunk = rows.drain(..rows.len().min(INSERT_CHUNK));

            let mut insert = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {table} (deduplication_id, payload, priority, retrieval, visible_after, created_at) "
            ));
            insert.push_values(chunk, |mut values, row| {
                values
                    .push_bind(row.deduplication_id)
                    .push_bind(row.payload)
                    .push_bind(row.priority)
                    .push_bind(0_i64)
                    .push_bind(row.visible_after)
                    .push_bind(row.created_at);
            });
            insert.push(" ON CONFLICT (deduplication_id) DO NOTHING");

            insert.build().execute(&mut *conn).await?;
        }

        Ok(())
    }
}

impl Backend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn table_exists<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<bool>> {
        async move {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = current_schema() AND table_name = $1
                )",
            )
            .bind(table.as_str())
            .fetch_one(&self.pool)
            .await?;

            Ok(exists)
        }
        .boxed()
    }

    fn create_table<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<()>> {
        async move {
            let name = table.quoted(KIND);

            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id BIGSERIAL PRIMARY KEY,
                    deduplication_id TEXT NOT NULL UNIQUE,
                    payload BYTEA NOT NULL,
                    priority BIGINT NOT NULL DEFAULT 0,
                    retrieval BIGINT NOT NULL DEFAULT 0,
                    visible_after BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM NOW()))::BIGINT,
                    created_at BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM NOW()))::BIGINT
                )"
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {name} (visible_after)",
                index = table.index_quoted(KIND),
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {name} (priority DESC, id ASC)",
                index = table.claim_index_quoted(KIND),
            ))
            .execute(&self.pool)
            .await?;

            Ok(())
        }
        .boxed()
    }

    fn drop_table<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<()>> {
        async move {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.quoted(KIND)))
                .execute(&self.pool)
                .await?;

            Ok(())
        }
        .boxed()
    }

    fn truncate_table<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<()>> {
        async move {
            sqlx::query(&format!("DELETE FROM {}", table.quoted(KIND)))
                .execute(&self.pool)
                .await?;

            Ok(())
        }
        .boxed()
    }

    fn claim<'a>(
        &'a self,
        table: &'a QueueName,
        limit: u32,
        now: i64,
        lease_expiry: i64,
    ) -> BoxFuture<'a, Result<Vec<MessageRow>>> {
        async move {
            let name = table.quoted(KIND);

            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "UPDATE {name}
                SET visible_after = $1, retrieval = retrieval + 1
                WHERE id IN (
                    SELECT id FROM {name}
                    WHERE visible_after < $2
                    ORDER BY priority DESC, id ASC
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING {COLUMNS}"
            ))
            .bind(lease_expiry)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

            Ok(rows)
        }
        .boxed()
    }

    fn insert_batch<'a>(
        &'a self,
        table: &'a QueueName,
        rows: Vec<PendingRow>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let name = table.quoted(KIND);
            let mut tx = self.pool.begin().await?;

            match Self::insert_chunks(&mut tx, &name, rows).await {
                Ok(()) => {
                    tx.commit().await?;
                    Ok(())
                }
                Err(e) => {
                    super::rollback(tx, table).await;
                    Err(e)
                }
            }
        }
        .boxed()
    }

    fn delete_batch<'a>(
        &'a self,
        table: &'a QueueName,
        ids: &'a [i64],
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE id = ANY($1)",
                table.quoted(KIND)
            ))
            .bind(ids)
            .execute(&self.pool)
            .await?;

            Ok(())
        }
        .boxed()
    }

    fn update_visibility<'a>(
        &'a self,
        table: &'a QueueName,
        ids: &'a [i64],
        visible_after: i64,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            sqlx::query(&format!(
                "UPDATE {} SET visible_after = $1 WHERE id = ANY($2)",
                table.quoted(KIND)
            ))
            .bind(visible_after)
            .bind(ids)
            .execute(&self.pool)
            .await?;

            Ok(())
        }
        .boxed()
    }

    fn count<'a>(&'a self, table: &'a QueueName, now: i64) -> BoxFuture<'a, Result<(i64, i64)>> {
        async move {
            let counts: (i64, i64) = sqlx::query_as(&format!(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN visible_after < $1 THEN 1 ELSE 0 END), 0)::BIGINT
                FROM {}",
                table.quoted(KIND)
            ))
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

            Ok(counts)
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move { self.pool.close().await }.boxed()
    }
}
