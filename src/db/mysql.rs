//! MySQL adapter.
//!
//! MySQL has no `UPDATE ... RETURNING`, so a claim is two statements in one
//! transaction: `SELECT ... FOR UPDATE SKIP LOCKED` takes row locks on the eligible
//! rows (concurrent claims skip them instead of waiting), then an `UPDATE` leases
//! exactly the locked ids. Committing releases the locks. Any failure rolls the whole
//! claim back, so a partial lease is never visible.

use futures_util::{future::BoxFuture, FutureExt};
use sqlx::{MySql, MySqlConnection, MySqlPool, QueryBuilder};

use super::{Backend, ID_CHUNK, INSERT_CHUNK};
use crate::{
    engine::BackendKind,
    error::Result,
    message::{MessageRow, PendingRow, COLUMNS},
    queue::QueueName,
};

const KIND: BackendKind = BackendKind::MySql;

#[derive(Clone)]
pub struct MySqlBackend {
    pool: MySqlPool,
}

impl MySqlBackend {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn claim_locked(
        conn: &mut MySqlConnection,
        table: &str,
        limit: u32,
        now: i64,
        lease_expiry: i64,
    ) -> Result<Vec<MessageRow>> {
        let mut rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {COLUMNS} FROM {table}
            WHERE visible_after < ?
            ORDER BY priority DESC, id ASC
            LIMIT ?
            FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await?;

        if rows.is_empty() {
            return Ok(rows);
        }

        let mut update = QueryBuilder::<MySql>::new(format!("UPDATE {table} SET visible_after = "));
        update.push_bind(lease_expiry);
        update.push(", retrieval = retrieval + 1 WHERE id IN (");
        let mut ids = update.separated(", ");
        for row in &rows {
            ids.push_bind(row.id);
        }
        ids.push_unseparated(")");

        update.build().execute(&mut *conn).await?;

        for row in &mut rows {
            row.retrieval += 1;
            row.visible_after = lease_expiry;
        }

        Ok(rows)
    }

    async fn insert_chunks(
        conn: &mut MySqlConnection,
        table: &str,
        mut rows: Vec<PendingRow>,
    ) -> Result<()> {
        while !rows.is_empty() {
            let chunk = rows.drain(..rows.len().min(INSERT_CHUNK));

            let mut insert = QueryBuilder::<MySql>::new(format!(
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
            // A no-op update on duplicate keys skips the row without hiding other
            // errors the way `INSERT IGNORE` would.
            insert.push(" ON DUPLICATE KEY UPDATE id = id");

            insert.build().execute(&mut *conn).await?;
        }

        Ok(())
    }

    /// Run `prefix (id, id, ...)` for every chunk of ids, with `visible_after` bound
    /// first when given.
    async fn for_ids(
        &self,
        prefix: &str,
        visible_after: Option<i64>,
        ids: &[i64],
    ) -> Result<()> {
        for chunk in ids.chunks(ID_CHUNK) {
            let mut query = QueryBuilder::<MySql>::new(prefix);
            if let Some(visible_after) = visible_after {
                query.push_bind(visible_after);
            }
            query.push(" WHERE id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            query.build().execute(&self.pool).await?;
        }

        Ok(())
    }
}

impl Backend for MySqlBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn table_exists<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<bool>> {
        async move {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM information_schema.tables
                WHERE table_schema = DATABASE() AND table_name = ?",
            )
            .bind(table.as_str())
            .fetch_one(&self.pool)
            .await?;

            Ok(count > 0)
        }
        .boxed()
    }

    fn create_table<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<()>> {
        async move {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                    deduplication_id VARCHAR(255) NOT NULL UNIQUE,
                    payload LONGBLOB NOT NULL,
                    priority BIGINT NOT NULL DEFAULT 0,
                    retrieval BIGINT NOT NULL DEFAULT 0,
                    visible_after BIGINT NOT NULL DEFAULT (UNIX_TIMESTAMP()),
                    created_at BIGINT NOT NULL DEFAULT (UNIX_TIMESTAMP()),
                    INDEX {index} (visible_after),
                    INDEX {claim_index} (priority DESC, id ASC)
                )",
                name = table.quoted(KIND),
                index = table.index_quoted(KIND),
                claim_index = table.claim_index_quoted(KIND),
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
            let mut tx = self.pool.begin().await?;

            match Self::claim_locked(&mut tx, &name, limit, now, lease_expiry).await {
                Ok(rows) => {
                    tx.commit().await?;
                    Ok(rows)
                }
                Err(e) => {
                    super::rollback(tx, table).await;
                    Err(e)
                }
            }
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
            let prefix = format!("DELETE FROM {}", table.quoted(KIND));
            self.for_ids(&prefix, None, ids).await
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
            let prefix = format!("UPDATE {} SET visible_after = ", table.quoted(KIND));
            self.for_ids(&prefix, Some(visible_after), ids).await
        }
        .boxed()
    }

    fn count<'a>(&'a self, table: &'a QueueName, now: i64) -> BoxFuture<'a, Result<(i64, i64)>> {
        async move {
            let counts: (i64, i64) = sqlx::query_as(&format!(
                "SELECT
                    COUNT(*),
                    CAST(COALESCE(SUM(CASE WHEN visible_after < ? THEN 1 ELSE 0 END), 0) AS SIGNED)
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
