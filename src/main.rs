use dbqueue::{Config, Engine, Message, ReceiveOptions};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dbqueue::init_tracing()?;

    let config = Config::load()?;
    let engine = Engine::connect_with(&config).await?;
    let queue = engine.create_queue(config.queue()).await?;

    queue
        .send_batch((0..10).map(|i| {
            Message::builder()
                .payload(format!("Hello {i}"))
                .priority(i % 3)
                .build()
        }))
        .await?;

    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                cancel.cancel();
            }
        }
    });

    let options = ReceiveOptions::default();

    queue
        .receive(&options, &cancel, |message| {
            let queue = &queue;
            async move {
                tracing::info!(
                    id = message.id,
                    priority = message.priority,
                    retrieval = message.retrieval,
                    "Received {}",
                    String::from_utf8_lossy(&message.payload)
                );
                queue.delete(message.id).await
            }
        })
        .await?;

    engine.close().await;

    Ok(())
}
