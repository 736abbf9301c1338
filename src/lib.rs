//! SQS-style message queues stored in ordinary database tables.
//!
//! Each queue is one table in PostgreSQL, MySQL, or SQLite. Consumers claim batches of
//! rows by leasing them (pushing `visible_after` into the future), process them, and
//! delete them. Anything not deleted before its lease lapses is delivered again, which
//! gives at-least-once delivery without a broker process.
//!
//! ```rust,no_run
//! use dbqueue::{Engine, Message, ReceiveOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> dbqueue::Result<()> {
//! let engine = Engine::connect("sqlite://jobs.db").await?;
//! let queue = engine.create_queue("jobs").await?;
//!
//! queue
//!     .send(Message::builder().payload("hello").priority(5).build())
//!     .await?;
//!
//! let cancel = CancellationToken::new();
//! queue
//!     .receive(&ReceiveOptions::default(), &cancel, |message| {
//!         let queue = queue.clone();
//!         async move { queue.delete(message.id).await }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
mod db;
pub mod engine;
pub mod error;
pub mod message;
pub mod queue;
pub mod receive;

pub use config::Config;
pub use engine::{BackendKind, Engine};
pub use error::{Error, Result};
pub use message::{Message, QueueStats, ReceivedMessage};
pub use queue::{Queue, QueueName};
pub use receive::ReceiveOptions;

/// Install a global `tracing` subscriber filtered by `DBQUEUE_LOG` (default `info`).
///
/// Debug builds log human-readable output, release builds log JSON.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("DBQUEUE_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
