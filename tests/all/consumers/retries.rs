use crate::helpers::{consumer, eventually, queue_name};
use anyhow::anyhow;
use serde_json::json;
use spanconsumer::amqp::configuration::{ProcessingOptions, QueueOptions};
use spanconsumer::consumers::ProcessorSettings;
use spanconsumer::transport::memory::InMemoryBroker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn quorum_queues_stop_redelivering_after_max_delivery_count() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("payments");
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .queue_options(QueueOptions::quorum())
                .processing_options(ProcessingOptions::default().with_max_delivery_count(2))
                .handler({
                    let attempts = attempts.clone();
                    move |_incoming| {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(anyhow!("The payment provider is down")) }
                    }
                }),
        )
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client.put_message(&in_key, json!({"amount": 10}), None).await.unwrap();
    eventually(|| broker.dead_letters(&in_key).len() == 1).await;
    // Give a wrongful redelivery the time to happen.
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.stop().await.unwrap();

    // Assert
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(broker.dead_letters(&in_key)[0].delivery_count, 2);
    assert_eq!(broker.queue_len(&in_key), 0);
}

#[tokio::test(start_paused = true)]
async fn max_delivery_count_has_no_effect_without_requeue() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("payments");
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .queue_options(QueueOptions::quorum())
                .processing_options(
                    ProcessingOptions::default()
                        .with_requeue(false)
                        .with_max_delivery_count(5),
                )
                .handler({
                    let attempts = attempts.clone();
                    move |_incoming| {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(anyhow!("Invalid payment")) }
                    }
                }),
        )
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client.put_message(&in_key, json!({"amount": -1}), None).await.unwrap();
    eventually(|| broker.dead_letters(&in_key).len() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.stop().await.unwrap();

    // Assert
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_len(&in_key), 0);
}

#[tokio::test(start_paused = true)]
async fn workers_can_reject_messages_they_succeeded_on() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("spam");
    let mut consumer = consumer(&broker);
    consumer
        .processor(ProcessorSettings::builder(&in_key).handler(|incoming| async move {
            incoming.set_reject();
            Ok::<_, anyhow::Error>(())
        }))
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client.put_message(&in_key, json!("buy now"), None).await.unwrap();
    eventually(|| broker.dead_letters(&in_key).len() == 1).await;
    client.stop().await.unwrap();

    // Assert
    assert!(broker.acked(&in_key).is_empty());
}

#[tokio::test(start_paused = true)]
async fn redelivered_messages_can_be_rejected_straight_away() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("flaky");
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .processing_options(ProcessingOptions {
                    reject_on_redelivered: true,
                    ..ProcessingOptions::default()
                })
                .handler({
                    let attempts = attempts.clone();
                    move |_incoming| {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(anyhow!("Still flaky")) }
                    }
                }),
        )
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client.put_message(&in_key, json!(1), None).await.unwrap();
    eventually(|| broker.dead_letters(&in_key).len() == 1).await;
    client.stop().await.unwrap();

    // Assert
    // Requeued once, then rejected on its redelivery.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
