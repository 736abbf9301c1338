use std::time::Duration;

use serde::Deserialize;
use snafu::ResultExt;

use crate::error::{ConfigSnafu, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite://dbqueue.db";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_QUEUE: &str = "example";

/// Connection settings, read from `DBQUEUE_`-prefixed environment variables.
#[derive(Clone, Default, Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub acquire_timeout_secs: Option<u64>,
    /// Queue used by the demo binary.
    pub queue: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        envy::prefixed("DBQUEUE_")
            .from_env::<Self>()
            .context(ConfigSnafu)
    }

    pub fn database_url(&self) -> &str {
        self.database_url
            .as_deref()
            .unwrap_or(DEFAULT_DATABASE_URL)
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }

    pub fn queue(&self) -> &str {
        self.queue.as_deref().unwrap_or(DEFAULT_QUEUE)
    }
}
