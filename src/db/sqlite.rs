//! SQLite adapter.
//!
//! SQLite serializes writers, so the claim statement holds the write lock from the
//! moment it starts reading eligible rows until it has leased them. There is no row
//! locking to skip; concurrent claims wait on the busy timeout instead.

use futures_util::{future::BoxFuture, FutureExt};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::{Backend, ID_CHUNK, INSERT_CHUNK};
use crate::{
    engine::BackendKind,
    error::Result,
    message::{MessageRow, PendingRow, COLUMNS},
    queue::QueueName,
};

const KIND: BackendKind = BackendKind::Sqlite;

#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert_chunks(
        conn: &mut SqliteConnection,
        table: &str,
        mut rows: Vec<PendingRow>,
    ) -> Result<()> {
        while !rows.is_empty() {
            let chunk = rows.drain(..rows.len().min(INSERT_CHUNK));

            let mut insert = QueryBuilder::<Sqlite>::new(format!(
                "INSERT OR IGNORE INTO {table} (deduplication_id, payload, priority, retrieval, visible_after, created_at) "
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

            insert.build().execute(&mut *conn).await?;
        }

        Ok(())
    }

    async fn for_ids(&self, prefix: &str, visible_after: Option<i64>, ids: &[i64]) -> Result<()> {
        for chunk in ids.chunks(ID_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new(prefix);
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

impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn table_exists<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<bool>> {
        async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = $1")
                    .bind(table.as_str())
                    .fetch_one(&self.pool)
                    .await?;

            Ok(count > 0)
        }
        .boxed()
    }

    fn create_table<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<()>> {
        async move {
            let name = table.quoted(KIND);

            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    deduplication_id TEXT NOT NULL UNIQUE,
                    payload BLOB NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 0,
                    retrieval INTEGER NOT NULL DEFAULT 0,
                    visible_after INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
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
                    COALESCE(SUM(CASE WHEN visible_after < $1 THEN 1 ELSE 0 END), 0)
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
