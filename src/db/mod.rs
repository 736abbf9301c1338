//! Storage backend adapters.
//!
//! Each supported database gets one adapter implementing [`Backend`]. The adapter owns
//! the whole claim algorithm for its engine, so shared code never branches on the
//! dialect:
//!
//! - [`postgres::PostgresBackend`] and [`sqlite::SqliteBackend`] claim with a single
//!   `UPDATE ... WHERE id IN (SELECT ...) RETURNING` statement.
//! - [`mysql::MySqlBackend`] has no `RETURNING`, so it locks the rows with
//!   `SELECT ... FOR UPDATE SKIP LOCKED` and updates them inside one transaction.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures_util::future::BoxFuture;
use sqlx::{Database, Transaction};

use crate::{
    engine::BackendKind,
    error::{Error, Result},
    message::{MessageRow, PendingRow, ReceivedMessage},
    queue::QueueName,
};

pub mod mysql;
pub mod postgres;
pub mod sqlite;

/// Rows per multi-row `INSERT`, keeping every dialect under its bind parameter limit.
pub(crate) const INSERT_CHUNK: usize = 100;

/// Ids per `IN (...)` list for the MySQL and SQLite bulk mutations.
pub(crate) const ID_CHUNK: usize = 500;

/// Operations a queue table needs from its database.
///
/// Timestamps are Unix seconds computed by the caller, so every adapter agrees on what
/// "now" means for one operation.
pub(crate) trait Backend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn table_exists<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<bool>>;

    /// Create the table and its index if they are missing.
    fn create_table<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<()>>;

    /// Drop the table if it exists.
    fn drop_table<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<()>>;

    /// Delete every row.
    fn truncate_table<'a>(&'a self, table: &'a QueueName) -> BoxFuture<'a, Result<()>>;

    /// Atomically select up to `limit` rows with `visible_after < now`, ordered by
    /// priority descending then id ascending, and lease them until `lease_expiry`.
    ///
    /// Returned rows reflect the lease: `retrieval` is incremented and `visible_after`
    /// equals `lease_expiry`. Each eligible row is returned to at most one caller.
    fn claim<'a>(
        &'a self,
        table: &'a QueueName,
        limit: u32,
        now: i64,
        lease_expiry: i64,
    ) -> BoxFuture<'a, Result<Vec<MessageRow>>>;

    /// Insert rows in one transaction, skipping any whose deduplication id exists.
    fn insert_batch<'a>(
        &'a self,
        table: &'a QueueName,
        rows: Vec<PendingRow>,
    ) -> BoxFuture<'a, Result<()>>;

    fn delete_batch<'a>(&'a self, table: &'a QueueName, ids: &'a [i64])
        -> BoxFuture<'a, Result<()>>;

    /// Set `visible_after` without touching `retrieval`.
    fn update_visibility<'a>(
        &'a self,
        table: &'a QueueName,
        ids: &'a [i64],
        visible_after: i64,
    ) -> BoxFuture<'a, Result<()>>;

    /// Total rows and rows eligible at `now`.
    fn count<'a>(&'a self, table: &'a QueueName, now: i64) -> BoxFuture<'a, Result<(i64, i64)>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

pub(crate) fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// The Unix timestamp `delay` from now.
pub(crate) fn unix_after(delay: Duration) -> Result<i64> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .map(|at| at.timestamp())
        .ok_or_else(|| Error::invalid_parameter(format!("duration {delay:?} is out of range")))
}

/// Restore claim order. `RETURNING` does not promise to follow the subquery's
/// `ORDER BY`, so adapters may hand rows back in any order.
pub(crate) fn sort_claimed(messages: &mut [ReceivedMessage]) {
    messages.sort_unstable_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
}

/// Roll back a failed transaction, logging rather than masking the original error if
/// the rollback itself fails.
pub(crate) async fn rollback<DB: Database>(tx: Transaction<'_, DB>, table: &QueueName) {
    match tx.rollback().await {
        Ok(()) => tracing::warn!(queue = %table, "Rolled back transaction"),
        Err(e) => tracing::error!(queue = %table, "Failed to roll back transaction: {e}"),
    }
}
