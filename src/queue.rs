use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    db::{self, Backend},
    engine::BackendKind,
    error::{Error, Result},
    message::{Message, PendingRow, QueueStats, ReceivedMessage},
};

/// Name of a queue, which is also the name of its backing table.
///
/// Names are interpolated into SQL, so they are restricted to plain identifiers:
/// an ASCII letter or underscore followed by letters, digits, or underscores. The
/// `sqlite_` prefix is reserved by SQLite and rejected on every backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Leaves room for the index suffix within the identifier limits of every backend.
    pub const MAX_LEN: usize = 48;

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        let mut chars = name.chars();
        let valid = name.len() <= Self::MAX_LEN
            && chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !is_reserved(&name);

        if !valid {
            return Err(Error::InvalidQueueName { name });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The table identifier, quoted for the given dialect.
    pub(crate) fn quoted(&self, kind: BackendKind) -> String {
        quote(&self.0, kind)
    }

    /// The identifier of the index on `visible_after`, used by stats and eligibility.
    pub(crate) fn index_quoted(&self, kind: BackendKind) -> String {
        quote(&format!("{}_visible_idx", self.0), kind)
    }

    /// The identifier of the index matching the claim order, `priority DESC, id ASC`.
    pub(crate) fn claim_index_quoted(&self, kind: BackendKind) -> String {
        quote(&format!("{}_claim_idx", self.0), kind)
    }
}

fn is_reserved(name: &str) -> bool {
    name.get(..RESERVED_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(RESERVED_PREFIX))
}

const RESERVED_PREFIX: &str = "sqlite_";

fn quote(ident: &str, kind: BackendKind) -> String {
    match kind {
        BackendKind::MySql => format!("`{ident}`"),
        BackendKind::Postgres | BackendKind::Sqlite => format!("\"{ident}\""),
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QueueName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for QueueName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Handle to one queue table.
///
/// Cheap to clone; clones share the engine's connection pool. Every operation checks a
/// connection out of the pool for its own duration only.
#[derive(Clone)]
pub struct Queue {
    name: QueueName,
    backend: Arc<dyn Backend>,
}

impl Queue {
    pub(crate) fn new(name: QueueName, backend: Arc<dyn Backend>) -> Self {
        Self { name, backend }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        self.send_batch([message]).await
    }

    /// Enqueue messages in one transaction.
    ///
    /// Messages whose deduplication id is already stored, or repeated earlier in the
    /// same batch, are skipped without error. Claim order is decided by the stored
    /// priority and id only.
    pub async fn send_batch(&self, messages: impl IntoIterator<Item = Message>) -> Result<()> {
        let now = db::unix_now();

        let rows = messages
            .into_iter()
            .map(|message| PendingRow::resolve(message, now))
            .collect::<Vec<_>>();

        if rows.is_empty() {
            return Ok(());
        }

        let count = rows.len();
        self.backend.insert_batch(&self.name, rows).await?;

        tracing::debug!(queue = %self.name, count, "Sent message batch");

        Ok(())
    }

    /// Claim up to `limit` eligible messages, leasing each of them for `lease`.
    ///
    /// Messages come back ordered by priority (highest first), then by id. No message
    /// returned here is returned to any concurrent caller until its lease lapses.
    pub async fn claim(&self, limit: u32, lease: Duration) -> Result<Vec<ReceivedMessage>> {
        if limit == 0 {
            return Err(Error::invalid_parameter("claim limit must be greater than 0"));
        }

        let now = db::unix_now();
        let lease_expiry = db::unix_after(lease)?;

        let rows = self
            .backend
            .claim(&self.name, limit, now, lease_expiry)
            .await?;

        let mut claimed = rows
            .into_iter()
            .map(ReceivedMessage::try_from)
            .collect::<Result<Vec<_>>>()?;

        db::sort_claimed(&mut claimed);

        if !claimed.is_empty() {
            tracing::debug!(queue = %self.name, count = claimed.len(), lease_expiry, "Claimed messages");
        }

        Ok(claimed)
    }

    /// Acknowledge a message. Deleting an unknown id is a no-op.
    pub async fn delete(&self, id: i64) -> Result<()> {
        self.delete_batch(&[id]).await
    }

    pub async fn delete_batch(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        self.backend.delete_batch(&self.name, ids).await
    }

    /// Make a message visible again `timeout` from now, without counting a retrieval.
    ///
    /// Use this to extend a lease while processing, or pass [`Duration::ZERO`] to hand
    /// the message back right away.
    pub async fn change_visibility(&self, id: i64, timeout: Duration) -> Result<()> {
        self.change_visibility_batch(&[id], timeout).await
    }

    pub async fn change_visibility_batch(&self, ids: &[i64], timeout: Duration) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let visible_after = db::unix_after(timeout)?;

        self.backend
            .update_visibility(&self.name, ids, visible_after)
            .await
    }

    /// Delete every message regardless of lease state.
    pub async fn purge(&self) -> Result<()> {
        self.backend.truncate_table(&self.name).await?;

        tracing::info!(queue = %self.name, "Purged queue");

        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let (total, visible) = self.backend.count(&self.name, db::unix_now()).await?;

        let total = u64::try_from(total).map_err(Error::internal)?;
        let visible = u64::try_from(visible).map_err(Error::internal)?;

        Ok(QueueStats {
            total,
            visible,
            not_visible: total.saturating_sub(visible),
        })
    }
}
