use crate::helpers::{consumer, eventually, queue_name};
use anyhow::anyhow;
use serde_json::json;
use spanconsumer::amqp::configuration::ProcessingOptions;
use spanconsumer::consumers::{DispatchError, ProcessorSettings};
use spanconsumer::scribe::ScribeError;
use spanconsumer::transport::memory::InMemoryBroker;
use std::sync::{Arc, Mutex};

#[tokio::test(start_paused = true)]
async fn every_error_handler_sees_the_failure_even_if_one_fails() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("invoices");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .processing_options(ProcessingOptions::default().with_requeue(false))
                .handler(|_incoming| async {
                    Err::<(), _>(anyhow!("The invoice template is missing"))
                }),
        )
        .unwrap();
    consumer
        .add_error_handler(
            |_error: Arc<DispatchError>, _processor: Arc<ProcessorSettings>| async {
                Err::<(), _>(anyhow!("The alerting service is down"))
            },
        )
        .add_error_handler(
            |_error: Arc<DispatchError>, _processor: Arc<ProcessorSettings>| async {
                if true {
                    panic!("The error handler has a bug");
                }
                Ok::<_, anyhow::Error>(())
            },
        )
        .add_error_handler({
            let seen = seen.clone();
            move |error: Arc<DispatchError>, processor: Arc<ProcessorSettings>| {
                let seen = seen.clone();
                async move {
                    let failure = error
                        .processor_error()
                        .ok_or_else(|| anyhow!("Expected a processor failure"))?;
                    seen.lock().unwrap().push((
                        processor.in_key().to_owned(),
                        failure.error.to_string(),
                        failure.incoming.media()?.cloned(),
                    ));
                    Ok::<_, anyhow::Error>(())
                }
            }
        });
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client.put_message(&in_key, json!({"id": 7}), None).await.unwrap();
    eventually(|| seen.lock().unwrap().len() == 1).await;
    eventually(|| broker.dead_letters(&in_key).len() == 1).await;
    // The consumer keeps consuming.
    client.put_message(&in_key, json!({"id": 8}), None).await.unwrap();
    eventually(|| seen.lock().unwrap().len() == 2).await;
    client.stop().await.unwrap();

    // Assert
    let seen = seen.lock().unwrap();
    assert_eq!(
        seen[0],
        (
            in_key.clone(),
            "The invoice template is missing".to_owned(),
            Some(json!({"id": 7}))
        )
    );
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_replies_are_reported_to_error_handlers() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("quotes");
    let out_key = queue_name("quotes-out");
    let reported = Arc::new(Mutex::new(Vec::new()));
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .out_key(&out_key)
                .processing_options(ProcessingOptions::default().with_requeue(false))
                .handler({
                    let broker = broker.clone();
                    move |_incoming, outgoing| {
                        // The broker stops confirming publishes while the message is processed.
                        broker.refuse_publish_confirms(true);
                        outgoing.set_media(json!({"price": 12}));
                        async { Ok::<_, anyhow::Error>(()) }
                    }
                }),
        )
        .unwrap();
    consumer.add_error_handler({
        let reported = reported.clone();
        move |error: Arc<DispatchError>, _processor: Arc<ProcessorSettings>| {
            let reported = reported.clone();
            async move {
                let confirm_failed = matches!(
                    &*error,
                    DispatchError::Reply(ScribeError::ConfirmFailed { .. })
                );
                reported.lock().unwrap().push(confirm_failed);
                Ok::<_, anyhow::Error>(())
            }
        }
    });
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client.put_message(&in_key, json!({"item": "tea"}), None).await.unwrap();
    eventually(|| broker.dead_letters(&in_key).len() == 1).await;
    client.stop().await.unwrap();

    // Assert
    assert_eq!(*reported.lock().unwrap(), vec![true]);
    assert!(broker.acked(&in_key).is_empty());
}
