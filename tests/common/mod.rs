//! Scenarios shared by every backend's test suite.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dbqueue::{Engine, Error, Message, Queue, ReceiveOptions, ReceivedMessage};
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(120);

/// A timestamp far enough in the past that the message is claimable right away.
pub fn past() -> i64 {
    chrono::Utc::now().timestamp() - 5
}

pub fn visible(payload: &str, priority: u32) -> Message {
    Message::builder()
        .payload(payload)
        .priority(priority)
        .visible_after(past())
        .build()
}

pub async fn fresh_queue(engine: &Engine, name: &str) -> Queue {
    engine.delete_queue(name).await.unwrap();
    engine.create_queue(name).await.unwrap()
}

/// Claim until something comes back or the timeout passes.
pub async fn claim_eventually(queue: &Queue, limit: u32, lease: Duration) -> Vec<ReceivedMessage> {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let claimed = queue.claim(limit, lease).await.unwrap();
            if !claimed.is_empty() {
                return claimed;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("timed out waiting for a claim")
}

pub async fn queue_lifecycle(engine: &Engine, name: &str) {
    engine.delete_queue(name).await.unwrap();

    assert!(matches!(
        engine.open_queue(name).await,
        Err(Error::QueueNotFound { .. })
    ));

    let queue = engine.create_queue(name).await.unwrap();
    assert_eq!(queue.name().as_str(), name);
    assert_eq!(queue.backend(), engine.backend());

    // Creating again is not an error and keeps existing messages.
    queue.send(visible("kept", 0)).await.unwrap();
    engine.create_queue(name).await.unwrap();

    let opened = engine.open_queue(name).await.unwrap();
    assert_eq!(opened.stats().await.unwrap().total, 1);

    engine.purge_queue(name).await.unwrap();
    assert_eq!(opened.stats().await.unwrap().total, 0);

    engine.delete_queue(name).await.unwrap();
    engine.delete_queue(name).await.unwrap();

    assert!(matches!(
        engine.open_queue(name).await,
        Err(Error::QueueNotFound { .. })
    ));
    assert!(matches!(
        engine.purge_queue(name).await,
        Err(Error::QueueNotFound { .. })
    ));
}

pub async fn round_trip(engine: &Engine, name: &str) {
    let queue = fresh_queue(engine, name).await;

    queue.send(visible("hello", 0)).await.unwrap();

    let claimed = queue.claim(10, Duration::from_secs(30)).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let message = &claimed[0];
    assert_eq!(message.payload, b"hello");
    assert_eq!(message.retrieval, 1);
    assert!(message.visible_after >= chrono::Utc::now().timestamp() + 29);

    // Leased, so nobody else sees it.
    assert!(queue.claim(10, Duration::from_secs(30)).await.unwrap().is_empty());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.visible, 0);
    assert_eq!(stats.not_visible, 1);

    queue.delete(message.id).await.unwrap();
    assert_eq!(queue.stats().await.unwrap().total, 0);

    // Deleting twice is a no-op.
    queue.delete(message.id).await.unwrap();
    queue.delete_batch(&[]).await.unwrap();

    queue
        .send_batch([visible("a", 0), visible("b", 0), visible("c", 0)])
        .await
        .unwrap();
    queue.claim(1, Duration::from_secs(30)).await.unwrap();

    queue.purge().await.unwrap();
    assert_eq!(queue.stats().await.unwrap().total, 0);
}

pub async fn delayed_messages(engine: &Engine, name: &str) {
    let queue = fresh_queue(engine, name).await;

    let later = chrono::Utc::now().timestamp() + 3_600;
    queue
        .send(
            Message::builder()
                .payload("later")
                .visible_after(later)
                .build(),
        )
        .await
        .unwrap();

    assert!(queue.claim(10, Duration::from_secs(30)).await.unwrap().is_empty());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.not_visible, 1);
}

pub async fn deduplication(engine: &Engine, name: &str) {
    let queue = fresh_queue(engine, name).await;

    let first = Message::builder()
        .payload("first")
        .deduplication_id("order-1")
        .visible_after(past())
        .build();
    let second = Message::builder()
        .payload("second")
        .deduplication_id("order-1")
        .visible_after(past())
        .build();

    queue.send(first).await.unwrap();
    queue.send(second).await.unwrap();

    assert_eq!(queue.stats().await.unwrap().total, 1);

    let batch = vec![
        Message::builder()
            .payload("b1")
            .deduplication_id("order-2")
            .build(),
        Message::builder()
            .payload("b2")
            .deduplication_id("order-2")
            .build(),
        Message::builder()
            .payload("again")
            .deduplication_id("order-1")
            .build(),
        Message::new("no key"),
        Message::new("no key"),
    ];
    queue.send_batch(batch).await.unwrap();

    // order-1, order-2, and two generated keys
    assert_eq!(queue.stats().await.unwrap().total, 4);

    let claimed = queue.claim(10, Duration::from_secs(30)).await.unwrap();
    let original = claimed
        .iter()
        .find(|m| m.deduplication_id == "order-1")
        .expect("order-1 is claimable");
    assert_eq!(original.payload, b"first");
}

pub async fn priority_order(engine: &Engine, name: &str) {
    let queue = fresh_queue(engine, name).await;

    queue
        .send_batch([
            visible("p1", 1),
            visible("p5", 5),
            visible("p9", 9),
            visible("p3", 3),
            visible("p7", 7),
        ])
        .await
        .unwrap();

    for payload in ["tie-1", "tie-2", "tie-3"] {
        queue.send(visible(payload, 4)).await.unwrap();
    }

    let received = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let options = ReceiveOptions::builder()
        .max_batch(3)
        .poll_interval(Duration::from_millis(50))
        .build();

    tokio::time::timeout(
        TIMEOUT,
        queue.receive(&options, &cancel, |message| {
            let queue = queue.clone();
            let received = received.clone();
            let cancel = cancel.clone();
            async move {
                queue.delete(message.id).await?;

                let mut received = received.lock().unwrap();
                received.push(String::from_utf8(message.payload).unwrap());
                if received.len() == 8 {
                    cancel.cancel();
                }

                Ok::<_, Error>(())
            }
        }),
    )
    .await
    .expect("timed out")
    .unwrap();

    assert_eq!(
        *received.lock().unwrap(),
        vec!["p9", "p7", "p5", "tie-1", "tie-2", "tie-3", "p3", "p1"]
    );
    assert_eq!(queue.stats().await.unwrap().total, 0);
}

pub async fn redelivery(engine: &Engine, name: &str) {
    let queue = fresh_queue(engine, name).await;

    queue.send(visible("retry me", 0)).await.unwrap();

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let options = ReceiveOptions::builder()
        .max_batch(1)
        .lease_duration(Duration::from_secs(1))
        .poll_interval(Duration::from_millis(100))
        .build();

    tokio::time::timeout(
        TIMEOUT,
        queue.receive(&options, &cancel, |message| {
            let deliveries = deliveries.clone();
            let cancel = cancel.clone();
            async move {
                let mut deliveries = deliveries.lock().unwrap();
                deliveries.push(message);
                if deliveries.len() == 3 {
                    cancel.cancel();
                }

                Ok::<_, Error>(())
            }
        }),
    )
    .await
    .expect("timed out")
    .unwrap();

    let deliveries = deliveries.lock().unwrap();
    let retrievals = deliveries.iter().map(|m| m.retrieval).collect::<Vec<_>>();
    assert_eq!(retrievals, vec![1, 2, 3]);

    assert!(deliveries.iter().all(|m| m.id == deliveries[0].id));
    assert!(deliveries
        .windows(2)
        .all(|pair| pair[0].visible_after < pair[1].visible_after));
}

pub async fn change_visibility(engine: &Engine, name: &str) {
    let queue = fresh_queue(engine, name).await;

    queue.send(visible("slow", 0)).await.unwrap();

    let claimed = queue.claim(1, Duration::from_secs(3_600)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let id = claimed[0].id;

    // Hand it back right away; it is claimable again without waiting out the hour.
    queue.change_visibility(id, Duration::ZERO).await.unwrap();

    let again = claim_eventually(&queue, 1, Duration::from_secs(3_600)).await;
    assert_eq!(again[0].id, id);
    assert_eq!(again[0].retrieval, 2, "changing visibility is not a retrieval");

    queue
        .change_visibility_batch(&[id, i64::MAX], Duration::from_secs(3_600))
        .await
        .unwrap();
    assert_eq!(queue.stats().await.unwrap().not_visible, 1);
}

pub async fn handler_errors_do_not_stop_delivery(engine: &Engine, name: &str) {
    let queue = fresh_queue(engine, name).await;

    queue
        .send_batch([visible("fails", 2), visible("succeeds", 1)])
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let options = ReceiveOptions::builder()
        .poll_interval(Duration::from_millis(50))
        .build();

    tokio::time::timeout(
        TIMEOUT,
        queue.receive(&options, &cancel, |message| {
            let queue = queue.clone();
            let seen = seen.clone();
            let cancel = cancel.clone();
            async move {
                let payload = String::from_utf8(message.payload).unwrap();
                {
                    let mut seen = seen.lock().unwrap();
                    seen.push(payload.clone());
                    if seen.len() == 2 {
                        cancel.cancel();
                    }
                }

                if payload == "fails" {
                    return Err(format!("could not process message {}", message.id));
                }

                queue.delete(message.id).await.map_err(|e| e.to_string())
            }
        }),
    )
    .await
    .expect("timed out")
    .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["fails", "succeeds"]);

    // The failed message is still there, leased until it expires.
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.not_visible, 1);
}

/// Concurrent claimers never see the same message.
pub async fn concurrent_claims(engine: &Engine, name: &str) {
    const MESSAGES: usize = 200;

    let queue = fresh_queue(engine, name).await;

    queue
        .send_batch((0..MESSAGES).map(|i| visible(&i.to_string(), (i % 4) as u32)))
        .await
        .unwrap();

    let claimers = (0..5)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut batches = Vec::new();
                loop {
                    let batch = queue.claim(7, Duration::from_secs(3_600)).await?;
                    if batch.is_empty() {
                        return Ok::<_, Error>(batches);
                    }
                    batches.push(batch.into_iter().map(|m| m.id).collect::<Vec<_>>());
                }
            })
        })
        .collect::<Vec<_>>();

    let mut seen = HashSet::new();
    for claimer in claimers {
        for batch in claimer.await.unwrap().unwrap() {
            assert!(batch.len() <= 7);
            for id in batch {
                assert!(seen.insert(id), "message {id} was claimed twice");
            }
        }
    }

    assert_eq!(seen.len(), MESSAGES);
}

/// Five senders and five deleting receivers working the same queue at once.
pub async fn concurrent_senders_and_receivers(engine: &Engine, name: &str, per_sender: usize) {
    const SENDERS: usize = 5;
    const RECEIVERS: usize = 5;

    let total = SENDERS * per_sender;
    let queue = fresh_queue(engine, name).await;

    let cancel = CancellationToken::new();
    let processed = Arc::new(AtomicUsize::new(0));
    let deliveries = Arc::new(Mutex::new(HashMap::<i64, Vec<usize>>::new()));

    let receivers = (0..RECEIVERS)
        .map(|receiver| {
            let queue = queue.clone();
            let cancel = cancel.clone();
            let processed = processed.clone();
            let deliveries = deliveries.clone();

            tokio::spawn(async move {
                let options = ReceiveOptions::builder()
                    .max_batch(10)
                    .lease_duration(Duration::from_secs(60))
                    .poll_interval(Duration::from_millis(50))
                    .build();

                queue
                    .receive(&options, &cancel, |message| {
                        let queue = queue.clone();
                        let cancel = cancel.clone();
                        let processed = processed.clone();
                        let deliveries = deliveries.clone();
                        async move {
                            queue.delete(message.id).await?;

                            deliveries
                                .lock()
                                .unwrap()
                                .entry(message.id)
                                .or_default()
                                .push(receiver);

                            if processed.fetch_add(1, Ordering::SeqCst) + 1 >= total {
                                cancel.cancel();
                            }

                            Ok::<_, Error>(())
                        }
                    })
                    .await
            })
        })
        .collect::<Vec<_>>();

    let senders = (0..SENDERS)
        .map(|sender| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for chunk in (0..per_sender).collect::<Vec<_>>().chunks(50) {
                    queue
                        .send_batch(
                            chunk
                                .iter()
                                .map(|i| Message::new(format!("{sender}-{i}"))),
                        )
                        .await?;
                }
                Ok::<_, Error>(())
            })
        })
        .collect::<Vec<_>>();

    for sender in senders {
        sender.await.unwrap().unwrap();
    }

    tokio::time::timeout(TIMEOUT, async {
        for receiver in receivers {
            receiver.await.unwrap().unwrap();
        }
    })
    .await
    .expect("receivers did not drain the queue in time");

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), total);
    for (id, receivers) in deliveries.iter() {
        assert_eq!(receivers.len(), 1, "message {id} processed by {receivers:?}");
    }

    assert_eq!(queue.stats().await.unwrap().total, 0);
}
