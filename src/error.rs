use snafu::Snafu;
use sqlx::{error::DatabaseError, mysql::MySqlDatabaseError, sqlite::SqliteError};

use crate::engine::BackendKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Failed to connect to {backend} database"))]
    Connect {
        backend: BackendKind,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Queue not found: {queue}"))]
    QueueNotFound { queue: String },

    #[snafu(display("Database not supported: {scheme}"))]
    BackendNotSupported { scheme: String },

    #[snafu(display("Invalid queue name: {name:?}"))]
    InvalidQueueName { name: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Error loading configuration"))]
    Config {
        #[snafu(source)]
        source: envy::Error,
    },

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Whether the failure is transient, i.e. re-invoking the operation (or restarting a
    /// `receive` loop) may succeed without any change on the caller's side.
    ///
    /// Database errors only count when they report a lock conflict, deadlock, or
    /// serialization failure. A missing table or a constraint violation is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sqlx { source } => match source {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
                    true
                }
                sqlx::Error::Database(e) => is_transient(&**e),
                _ => false,
            },
            _ => false,
        }
    }
}

fn is_transient(e: &dyn DatabaseError) -> bool {
    if let Some(e) = e.try_downcast_ref::<MySqlDatabaseError>() {
        return is_transient_mysql(e.number());
    }

    let Some(code) = e.code() else {
        return false;
    };

    if e.try_downcast_ref::<SqliteError>().is_some() {
        is_transient_sqlite(&code)
    } else {
        is_transient_sqlstate(&code)
    }
}

/// Serialization failure, deadlock, lock not available.
fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "55P03")
}

/// `ER_LOCK_WAIT_TIMEOUT`, `ER_LOCK_DEADLOCK`.
fn is_transient_mysql(number: u16) -> bool {
    matches!(number, 1205 | 1213)
}

/// `SQLITE_BUSY` and `SQLITE_LOCKED`, including their extended codes.
fn is_transient_sqlite(code: &str) -> bool {
    code.parse::<i32>()
        .is_ok_and(|code| matches!(code & 0xff, 5 | 6))
}
