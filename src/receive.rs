//! The delivery loop.
//!
//! [`Queue::receive`] repeatedly claims a batch, hands each message to a handler in claim
//! order, and sleeps for the poll interval only when a claim comes back empty. A busy
//! queue is therefore drained back to back, and an idle one costs one claim per poll
//! interval. [`Queue::stream`] offers the same loop as a pull-based [`Stream`].
//!
//! Neither form acknowledges anything on the caller's behalf: a handler that wants a
//! message gone must call [`Queue::delete`], otherwise it is redelivered once its lease
//! lapses.

use std::{collections::VecDeque, fmt::Display, future::Future, time::Duration};

use futures_util::{stream, Stream};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    message::ReceivedMessage,
    queue::Queue,
};

/// Options for [`Queue::receive`] and [`Queue::stream`].
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct ReceiveOptions {
    /// Most messages claimed per round trip
    #[builder(default = ReceiveOptions::DEFAULT_MAX_BATCH)]
    pub max_batch: u32,
    /// How long claimed messages stay hidden from other consumers
    #[builder(default = ReceiveOptions::DEFAULT_LEASE_DURATION)]
    pub lease_duration: Duration,
    /// Sleep between claims that come back empty
    #[builder(default = ReceiveOptions::DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,
}

impl ReceiveOptions {
    pub const DEFAULT_MAX_BATCH: u32 = 10;
    pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn validate(&self) -> Result<()> {
        if self.max_batch == 0 {
            return Err(Error::invalid_parameter("max_batch must be greater than 0"));
        }

        if self.poll_interval.is_zero() {
            return Err(Error::invalid_parameter(
                "poll_interval must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Queue {
    /// Deliver messages to `handler` until `cancel` fires or a claim fails.
    ///
    /// Messages are handled one at a time, in claim order, on the task that runs this
    /// future. A handler error is logged and delivery carries on with the rest of the
    /// batch; the message itself is left alone, so it comes back after its lease.
    ///
    /// Cancellation is observed between iterations and during the idle sleep. It never
    /// interrupts a claim or a running handler. A claim error ends the loop and is
    /// returned; callers that want to keep consuming should restart it (see
    /// [`Error::is_retryable`]).
    pub async fn receive<F, Fut, E>(
        &self,
        options: &ReceiveOptions,
        cancel: &CancellationToken,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(ReceivedMessage) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Display,
    {
        options.validate()?;

        while !cancel.is_cancelled() {
            let batch = self
                .claim(options.max_batch, options.lease_duration)
                .await?;

            if batch.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.poll_interval) => continue,
                }
            }

            for message in batch {
                let id = message.id;
                let retrieval = message.retrieval;

                if let Err(e) = handler(message).await {
                    tracing::warn!(queue = %self.name(), id, retrieval, "Message handler failed: {e}");
                }
            }
        }

        tracing::debug!(queue = %self.name(), "Receive loop cancelled");

        Ok(())
    }

    /// A stream of claimed messages, in claim order.
    ///
    /// Claims happen lazily, a batch at a time, when the previous batch has been
    /// consumed. The stream ends once `cancel` fires and every message already claimed
    /// has been yielded, and yields the error (then nothing further) if a claim fails.
    pub fn stream(
        &self,
        options: ReceiveOptions,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<ReceivedMessage>> + Send + 'static {
        let state = StreamState {
            queue: self.clone(),
            options,
            cancel,
            buffered: VecDeque::new(),
        };

        stream::try_unfold(state, StreamState::next)
    }
}

struct StreamState {
    queue: Queue,
    options: ReceiveOptions,
    cancel: CancellationToken,
    buffered: VecDeque<ReceivedMessage>,
}

impl StreamState {
    async fn next(mut self) -> Result<Option<(ReceivedMessage, Self)>> {
        self.options.validate()?;

        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Ok(Some((message, self)));
            }

            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let batch = self
                .queue
                .claim(self.options.max_batch, self.options.lease_duration)
                .await?;

            if batch.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }

            self.buffered.extend(batch);
        }
    }
}
