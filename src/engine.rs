use std::{str::FromStr, sync::Arc, time::Duration};

use snafu::ResultExt;
use sqlx::{
    mysql::MySqlPoolOptions,
    postgres::PgPoolOptions,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions, SqliteSynchronous},
    MySqlPool, PgPool, SqlitePool,
};

use crate::{
    config::Config,
    db::{mysql::MySqlBackend, postgres::PostgresBackend, sqlite::SqliteBackend, Backend},
    error::{ConnectSnafu, Error, Result},
    queue::{Queue, QueueName},
};

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The database engines a queue can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BackendKind {
    #[strum(to_string = "postgres", serialize = "postgresql")]
    Postgres,
    #[strum(to_string = "mysql", serialize = "mariadb")]
    MySql,
    #[strum(to_string = "sqlite")]
    Sqlite,
}

impl BackendKind {
    /// Pick the backend from the scheme of a connection URL.
    pub fn detect(url: &str) -> Result<Self> {
        let scheme = url.split_once(':').map(|(scheme, _)| scheme).unwrap_or("");

        scheme.parse().map_err(|_| Error::BackendNotSupported {
            scheme: scheme.to_owned(),
        })
    }
}

/// Entry point: owns the connection pool and manages queue tables.
///
/// The backend is chosen once, when the engine is built, and every [`Queue`] opened
/// from it shares the same adapter and pool.
#[derive(Clone)]
pub struct Engine {
    backend: Arc<dyn Backend>,
}

impl Engine {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(&Config {
            database_url: Some(url.to_owned()),
            ..Config::default()
        })
        .await
    }

    pub async fn connect_with(config: &Config) -> Result<Self> {
        let url = config.database_url();
        let backend = BackendKind::detect(url)?;

        let engine = match backend {
            BackendKind::Postgres => Self::postgres(
                PgPoolOptions::new()
                    .max_connections(config.max_connections())
                    .acquire_timeout(config.acquire_timeout())
                    .connect(url)
                    .await
                    .context(ConnectSnafu { backend })?,
            ),
            BackendKind::MySql => Self::mysql(
                MySqlPoolOptions::new()
                    .max_connections(config.max_connections())
                    .acquire_timeout(config.acquire_timeout())
                    .connect(url)
                    .await
                    .context(ConnectSnafu { backend })?,
            ),
            BackendKind::Sqlite => {
                let opts = SqliteConnectOptions::from_str(url)
                    .context(ConnectSnafu { backend })?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .locking_mode(SqliteLockingMode::Normal)
                    .busy_timeout(SQLITE_BUSY_TIMEOUT);

                let mut pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections())
                    .acquire_timeout(config.acquire_timeout());

                // Every connection to an in-memory database is a separate database, and
                // closing the only one loses it.
                if is_sqlite_memory(url) {
                    pool = pool
                        .max_connections(1)
                        .min_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None);
                }

                Self::sqlite(
                    pool.connect_with(opts)
                        .await
                        .context(ConnectSnafu { backend })?,
                )
            }
        };

        tracing::info!(%backend, "Connected to database");

        Ok(engine)
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self::from_backend(PostgresBackend::new(pool))
    }

    pub fn mysql(pool: MySqlPool) -> Self {
        Self::from_backend(MySqlBackend::new(pool))
    }

    pub fn sqlite(pool: SqlitePool) -> Self {
        Self::from_backend(SqliteBackend::new(pool))
    }

    fn from_backend(backend: impl Backend) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Create the queue table if it does not exist yet and return a handle to it.
    pub async fn create_queue(&self, name: impl AsRef<str>) -> Result<Queue> {
        let name = QueueName::new(name.as_ref())?;

        self.backend.create_table(&name).await?;

        tracing::info!(queue = %name, backend = %self.backend(), "Created queue");

        Ok(Queue::new(name, self.backend.clone()))
    }

    /// Open an existing queue, failing with [`Error::QueueNotFound`] if its table is
    /// missing.
    pub async fn open_queue(&self, name: impl AsRef<str>) -> Result<Queue> {
        let name = QueueName::new(name.as_ref())?;

        if !self.backend.table_exists(&name).await? {
            return Err(Error::queue_not_found(name));
        }

        Ok(Queue::new(name, self.backend.clone()))
    }

    /// Drop the queue table and every message in it. Dropping a missing queue succeeds.
    pub async fn delete_queue(&self, name: impl AsRef<str>) -> Result<()> {
        let name = QueueName::new(name.as_ref())?;

        self.backend.drop_table(&name).await?;

        tracing::info!(queue = %name, "Deleted queue");

        Ok(())
    }

    pub async fn purge_queue(&self, name: impl AsRef<str>) -> Result<()> {
        self.open_queue(name).await?.purge().await
    }

    pub async fn close(&self) {
        self.backend.close().await
    }
}

fn is_sqlite_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}
