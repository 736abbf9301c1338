//! Message types for the queue tables.
//!
//! A queue is a single table with one row per message. Rows move through a small
//! lifecycle that is expressed entirely through the `visible_after` column:
//!
//! 1. A row is inserted by a send, visible immediately unless the sender asked for a
//!    later `visible_after`.
//! 2. A claim leases the row by pushing `visible_after` into the future and bumping
//!    `retrieval`. Other consumers cannot see it until the lease lapses.
//! 3. The consumer deletes the row once it is done with it. If it never does, the
//!    lease expires and the row becomes eligible again, which is how redelivery works.
//!
//! There is no dead-letter state; consumers can inspect [`ReceivedMessage::retrieval`]
//! to implement their own poison-message policy.

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::error::{Error, Result};

/// A message to be enqueued.
///
/// Only the payload is required. Messages without a deduplication id are assigned a
/// random one on send, and messages without `visible_after` are visible immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Message {
    /// Opaque message content
    #[builder(into)]
    pub payload: Vec<u8>,
    /// Higher priorities are claimed first
    #[builder(default)]
    pub priority: u32,
    /// Idempotency key; a second send with the same key is silently dropped
    #[builder(into)]
    pub deduplication_id: Option<String>,
    /// Unix timestamp (seconds) before which the message cannot be claimed
    pub visible_after: Option<i64>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::builder().payload(payload).build()
    }
}

/// A message returned by a claim.
///
/// `visible_after` holds the expiry of the lease taken by the claim that produced this
/// value, and `retrieval` already counts that claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub id: i64,
    pub deduplication_id: String,
    pub payload: Vec<u8>,
    pub priority: u32,
    pub retrieval: u32,
    pub visible_after: i64,
    pub created_at: i64,
}

/// Row counts for a queue table at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// All rows in the table
    pub total: u64,
    /// Rows a claim could pick up right now
    pub visible: u64,
    /// Rows hidden by a lease or a delayed `visible_after`
    pub not_visible: u64,
}

/// Column list shared by every claim query.
pub(crate) const COLUMNS: &str =
    "id, deduplication_id, payload, priority, retrieval, visible_after, created_at";

/// A queue row as stored. All integer columns are `BIGINT` on every backend.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct MessageRow {
    pub id: i64,
    pub deduplication_id: String,
    pub payload: Vec<u8>,
    pub priority: i64,
    pub retrieval: i64,
    pub visible_after: i64,
    pub created_at: i64,
}

impl TryFrom<MessageRow> for ReceivedMessage {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Self {
            priority: u32::try_from(row.priority).map_err(|_| {
                Error::internal(eyre::eyre!(
                    "message {} has out of range priority {}",
                    row.id,
                    row.priority
                ))
            })?,
            retrieval: u32::try_from(row.retrieval).map_err(|_| {
                Error::internal(eyre::eyre!(
                    "message {} has out of range retrieval count {}",
                    row.id,
                    row.retrieval
                ))
            })?,
            id: row.id,
            deduplication_id: row.deduplication_id,
            payload: row.payload,
            visible_after: row.visible_after,
            created_at: row.created_at,
        })
    }
}

/// A message with every default resolved, ready to be inserted.
#[derive(Debug, Clone)]
pub(crate) struct PendingRow {
    pub deduplication_id: String,
    pub payload: Vec<u8>,
    pub priority: i64,
    pub visible_after: i64,
    pub created_at: i64,
}

impl PendingRow {
    pub fn resolve(message: Message, now: i64) -> Self {
        Self {
            deduplication_id: message
                .deduplication_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            payload: message.payload,
            priority: i64::from(message.priority),
            visible_after: message.visible_after.unwrap_or(now),
            created_at: now,
        }
    }
}
