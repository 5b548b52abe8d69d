use crate::helpers::{consumer, eventually, queue_name};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::json;
use spanconsumer::amqp::configuration::ProcessingOptions;
use spanconsumer::codec::{MimeType, TypedSchema};
use spanconsumer::consumers::{ConsumerError, ProcessorSettings};
use spanconsumer::transport::memory::InMemoryBroker;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Order {
    qty: u64,
}

#[tokio::test(start_paused = true)]
async fn replies_are_published_to_the_output_queue() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder("orders.in")
                .out_key("orders.out")
                .handler(|incoming, outgoing| async move {
                    let qty = incoming
                        .media()?
                        .and_then(|order| order["qty"].as_u64())
                        .ok_or_else(|| anyhow!("The order has no quantity"))?;
                    outgoing.set_media(json!({ "qty": qty * 2 }));
                    Ok::<_, anyhow::Error>(())
                }),
        )
        .unwrap();
    let mut client = consumer.test_client(true);
    client.start().await.unwrap();

    // Act
    client
        .put_message("orders.in", json!({"qty": 3}), Some(MimeType::Json))
        .await
        .unwrap();
    let reply = client.pull_message("orders.out", None, 10).await.unwrap();
    client.stop().await.unwrap();

    // Assert
    assert_eq!(reply.media().unwrap(), Some(&json!({"qty": 6})));
    assert_eq!(reply.mimetype(), Some(&MimeType::Json));
    assert_eq!(broker.acked("orders.in").len(), 1);
    assert_eq!(broker.queue_len("orders.out"), 0);
}

#[tokio::test(start_paused = true)]
async fn nothing_is_published_if_the_worker_sets_no_reply() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("audit");
    let out_key = queue_name("audit-out");
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .out_key(&out_key)
                .handler(|_incoming, _outgoing| async { Ok::<_, anyhow::Error>(()) }),
        )
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client.put_message(&in_key, json!("hello"), None).await.unwrap();
    eventually(|| broker.acked(&in_key).len() == 1).await;
    client.stop().await.unwrap();

    // Assert
    assert!(broker.queue_exists(&out_key));
    assert_eq!(broker.queue_len(&out_key), 0);
}

#[tokio::test(start_paused = true)]
async fn an_explicitly_empty_reply_is_published() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("ping");
    let out_key = queue_name("pong");
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .out_key(&out_key)
                .handler(|_incoming, outgoing| async move {
                    outgoing.set_empty();
                    Ok::<_, anyhow::Error>(())
                }),
        )
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client.put_message(&in_key, json!("ping"), None).await.unwrap();
    let reply = client.pull_message(&out_key, None, 10).await.unwrap();
    client.stop().await.unwrap();

    // Assert
    assert!(reply.body().is_empty());
    assert_eq!(reply.media().unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn schemas_apply_to_both_directions() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("orders");
    let out_key = queue_name("orders-out");
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .in_type::<Order>()
                .out_key(&out_key)
                .out_type::<Order>()
                .processing_options(ProcessingOptions::default().with_requeue(false))
                .handler(|incoming, outgoing| async move {
                    let order: Order = incoming
                        .media_as()?
                        .ok_or_else(|| anyhow!("Empty order"))?;
                    outgoing.set_media_from(&Order {
                        qty: order.qty * 2,
                    })?;
                    Ok::<_, anyhow::Error>(())
                }),
        )
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client
        .put_message(&in_key, json!({"qty": "three"}), None)
        .await
        .unwrap();
    client.put_message(&in_key, json!({"qty": 21}), None).await.unwrap();
    let reply = client
        .pull_message(&out_key, Some(Arc::new(TypedSchema::<Order>::new())), 10)
        .await
        .unwrap();
    eventually(|| broker.dead_letters(&in_key).len() == 1).await;
    client.stop().await.unwrap();

    // Assert
    assert_eq!(reply.media_as::<Order>().unwrap(), Some(Order { qty: 42 }));
    let rejected = &broker.dead_letters(&in_key)[0];
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&rejected.payload).unwrap(),
        json!({"qty": "three"})
    );
}

#[tokio::test(start_paused = true)]
async fn custom_mimetypes_are_used_for_replies() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("shout");
    let out_key = queue_name("shout-out");
    let mut consumer = consumer(&broker);
    consumer.register_mimetype(
        MimeType::Text,
        |value: &serde_json::Value| -> Result<Vec<u8>, anyhow::Error> {
            Ok(value.as_str().unwrap_or_default().to_uppercase().into_bytes())
        },
        |body: &[u8]| -> Result<serde_json::Value, anyhow::Error> {
            Ok(serde_json::Value::String(String::from_utf8(body.to_vec())?))
        },
    );
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .out_key(&out_key)
                .handler(|incoming, outgoing| async move {
                    if let Some(media) = incoming.media()? {
                        outgoing.set_media(media.clone());
                    }
                    outgoing.set_mimetype(MimeType::Text);
                    Ok::<_, anyhow::Error>(())
                }),
        )
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client
        .put_message(&in_key, json!("quiet please"), Some(MimeType::Text))
        .await
        .unwrap();
    let reply = client.pull_message(&out_key, None, 10).await.unwrap();
    client.stop().await.unwrap();

    // Assert
    assert_eq!(reply.body(), b"QUIET PLEASE");
}

#[test]
fn a_queue_can_only_have_one_processor() {
    let mut consumer = consumer(&InMemoryBroker::new());
    consumer
        .processor(
            ProcessorSettings::builder("orders.in").handler(|_incoming| async {
                Ok::<_, anyhow::Error>(())
            }),
        )
        .unwrap();

    let outcome = consumer.processor(
        ProcessorSettings::builder("orders.in")
            .out_key("orders.out")
            .handler(|_incoming, _outgoing| async { Ok::<_, anyhow::Error>(()) }),
    );

    assert!(matches!(outcome, Err(ConsumerError::DuplicateProcessor(q)) if q == "orders.in"));
    assert_eq!(consumer.settings().processors().count(), 1);
}
