use crate::helpers::{consumer, eventually, queue_name};
use anyhow::anyhow;
use serde_json::json;
use spanconsumer::amqp::configuration::ConnectionSettings;
use spanconsumer::consumers::{ConsumerError, Lifecycle, ProcessorSettings};
use spanconsumer::scribe::Scribe;
use spanconsumer::transport::memory::InMemoryBroker;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn a_consumer_can_only_be_reset_after_shutting_down() {
    // Arrange
    let broker = InMemoryBroker::new();
    let consumer = consumer(&broker);
    assert!(matches!(consumer.reset(), Err(ConsumerError::NotStarted)));
    assert!(matches!(consumer.lifecycle(), Err(ConsumerError::NotStarted)));
    let mut client = consumer.test_client(false);

    // Act
    client.start().await.unwrap();
    let before_shutdown = consumer.reset();
    let second_start = consumer.test_client(false).start().await;
    client.stop().await.unwrap();

    // Assert
    assert!(matches!(before_shutdown, Err(ConsumerError::NotShutDown)));
    assert!(matches!(second_start, Err(ConsumerError::LifecycleActive)));
    // Stopping the client resets the consumer.
    assert!(matches!(consumer.lifecycle(), Err(ConsumerError::NotStarted)));
}

#[tokio::test(start_paused = true)]
async fn a_reset_consumer_runs_again_on_a_new_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("restart");
    let processed = Arc::new(AtomicUsize::new(0));
    let mut consumer = consumer(&broker);
    consumer
        .processor(ProcessorSettings::builder(&in_key).handler({
            let processed = processed.clone();
            move |_incoming| {
                processed.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            }
        }))
        .unwrap();

    // Act
    for round in 1..=2 {
        let mut client = consumer.test_client(false);
        client.start().await.unwrap();
        client.put_message(&in_key, json!(round), None).await.unwrap();
        eventually(|| processed.load(Ordering::SeqCst) == round).await;
        client.stop().await.unwrap();
    }

    // Assert
    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.acked(&in_key).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn in_flight_messages_complete_before_shutting_down() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("slow");
    let completed = Arc::new(AtomicBool::new(false));
    let mut consumer = consumer(&broker);
    consumer
        .processor(ProcessorSettings::builder(&in_key).handler({
            let completed = completed.clone();
            move |_incoming| {
                let completed = completed.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    completed.store(true, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            }
        }))
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();
    let lifecycle = client.lifecycle().unwrap().clone();
    client.put_message(&in_key, json!("slow"), None).await.unwrap();
    eventually(|| lifecycle.active_workers() == 1).await;

    // Act
    consumer.signal_shutdown().unwrap();
    client.stop().await.unwrap();

    // Assert
    assert!(completed.load(Ordering::SeqCst));
    assert_eq!(lifecycle.active_workers(), 0);
    assert_eq!(broker.acked(&in_key).len(), 1);
    assert!(lifecycle.loop_stopped().is_set());
    assert!(lifecycle.shutdown_complete().is_set());
}

#[tokio::test(start_paused = true)]
async fn a_failing_startup_task_aborts_the_startup() {
    // Arrange
    let broker = InMemoryBroker::new();
    let ran = Arc::new(Mutex::new(Vec::new()));
    let record = |name: &'static str| {
        let ran = ran.clone();
        move |_lifecycle: Arc<Lifecycle>| {
            ran.lock().unwrap().push(name);
            async { Ok::<_, anyhow::Error>(()) }
        }
    };
    let mut consumer = consumer(&broker)
        .on_startup(record("first startup task"))
        .on_startup(|_lifecycle: Arc<Lifecycle>| async {
            Err::<(), _>(anyhow!("The cache could not be warmed up"))
        })
        .on_startup(record("last startup task"))
        .on_shutdown(record("shutdown task"));
    consumer
        .processor(
            ProcessorSettings::builder(queue_name("never"))
                .handler(|_incoming| async { Ok::<_, anyhow::Error>(()) }),
        )
        .unwrap();
    let mut client = consumer.test_client(false);

    // Act
    let outcome = client.start().await;

    // Assert
    assert!(matches!(outcome, Err(ConsumerError::Startup(_))));
    assert_eq!(
        *ran.lock().unwrap(),
        vec!["first startup task", "shutdown task"]
    );
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(consumer.lifecycle(), Err(ConsumerError::NotStarted)));
}

#[tokio::test(start_paused = true)]
async fn a_failing_shutdown_task_does_not_stop_the_others() {
    // Arrange
    let broker = InMemoryBroker::new();
    let flushed = Arc::new(AtomicBool::new(false));
    let consumer = consumer(&broker)
        .on_shutdown(|_lifecycle: Arc<Lifecycle>| async {
            Err::<(), _>(anyhow!("The metrics backend is gone"))
        })
        .on_shutdown({
            let flushed = flushed.clone();
            move |lifecycle: Arc<Lifecycle>| {
                let flushed = flushed.clone();
                async move {
                    // Shutdown tasks run before the connection is closed.
                    assert!(lifecycle.scribe().is_connected());
                    flushed.store(true, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            }
        });
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();

    // Act
    client.stop().await.unwrap();

    // Assert
    assert!(flushed.load(Ordering::SeqCst));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn startup_waits_for_the_broker() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_connections(2);
    let consumer = consumer(&broker);
    let mut client = consumer.test_client(false);

    // Act
    client.start().await.unwrap();

    // Assert
    let lifecycle = client.lifecycle().unwrap().clone();
    assert!(lifecycle.startup_complete().is_set());
    assert!(!lifecycle.startup_error().is_set());
    assert_eq!(broker.connections_opened(), 1);
    client.stop().await.unwrap();
}

#[test]
fn run_blocks_until_shutdown_is_signaled_from_another_thread() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("audit");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let scribe = Scribe::new(ConnectionSettings::default(), Arc::new(broker.clone()));
        scribe.connect().await.unwrap();
        scribe.publish(&in_key, json!("hi"), None, None).await.unwrap();
        scribe.close_connection().await.unwrap();
    });

    let processed = Arc::new(AtomicUsize::new(0));
    let mut consumer = consumer(&broker);
    consumer
        .processor(ProcessorSettings::builder(&in_key).handler({
            let processed = processed.clone();
            move |_incoming| {
                processed.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            }
        }))
        .unwrap();
    let consumer = Arc::new(consumer);

    // Act
    let runner = std::thread::spawn({
        let consumer = consumer.clone();
        move || consumer.run()
    });
    let mut waited = Duration::ZERO;
    while processed.load(Ordering::SeqCst) == 0 {
        assert!(waited < Duration::from_secs(10), "The message was never processed");
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    consumer.signal_shutdown().unwrap();
    runner.join().unwrap().unwrap();

    // Assert
    let lifecycle = consumer.lifecycle().unwrap();
    assert!(lifecycle.shutdown_complete().is_set());
    assert!(!lifecycle.startup_error().is_set());
    assert_eq!(broker.acked(&in_key).len(), 1);
    assert_eq!(broker.open_connections(), 0);
    consumer.reset().unwrap();
}

#[tokio::test(start_paused = true)]
async fn a_panicking_startup_task_aborts_the_startup() {
    // Arrange
    let broker = InMemoryBroker::new();
    let shut_down = Arc::new(AtomicBool::new(false));
    let consumer = consumer(&broker)
        .on_startup(|_lifecycle: Arc<Lifecycle>| async {
            if true {
                panic!("The feature flags are corrupted");
            }
            Ok::<_, anyhow::Error>(())
        })
        .on_shutdown({
            let shut_down = shut_down.clone();
            move |_lifecycle: Arc<Lifecycle>| {
                shut_down.store(true, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            }
        });
    let mut client = consumer.test_client(false);

    // Act
    let outcome = client.start().await;

    // Assert
    assert!(matches!(outcome, Err(ConsumerError::Startup(_))));
    assert!(shut_down.load(Ordering::SeqCst));
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(consumer.lifecycle(), Err(ConsumerError::NotStarted)));
}

#[test]
fn run_completes_its_shutdown_after_a_panicking_startup_task() {
    // Arrange
    let broker = InMemoryBroker::new();
    let consumer = consumer(&broker).on_startup(|_lifecycle: Arc<Lifecycle>| async {
        if true {
            panic!("The feature flags are corrupted");
        }
        Ok::<_, anyhow::Error>(())
    });

    // Act
    let outcome = consumer.run();

    // Assert
    assert!(outcome.is_ok());
    let lifecycle = consumer.lifecycle().unwrap();
    assert!(lifecycle.startup_error().is_set());
    assert!(lifecycle.loop_stopped().is_set());
    assert!(lifecycle.shutdown_complete().is_set());
    assert_eq!(broker.open_connections(), 0);
    consumer.reset().unwrap();
}

#[tokio::test(start_paused = true)]
async fn a_panicking_shutdown_task_does_not_stop_the_others() {
    // Arrange
    let broker = InMemoryBroker::new();
    let flushed = Arc::new(AtomicBool::new(false));
    let consumer = consumer(&broker)
        .on_shutdown(|_lifecycle: Arc<Lifecycle>| async {
            if true {
                panic!("The metrics backend is gone");
            }
            Ok::<_, anyhow::Error>(())
        })
        .on_shutdown({
            let flushed = flushed.clone();
            move |_lifecycle: Arc<Lifecycle>| {
                flushed.store(true, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            }
        });
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();
    let lifecycle = client.lifecycle().unwrap().clone();

    // Act
    client.stop().await.unwrap();

    // Assert
    assert!(flushed.load(Ordering::SeqCst));
    assert!(lifecycle.loop_stopped().is_set());
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn a_failed_queue_cleanup_leaves_the_consumer_startable() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("cleanup");
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .handler(|_incoming| async { Ok::<_, anyhow::Error>(()) }),
        )
        .unwrap();
    broker.refuse_queue_deletes(true);
    broker.fail_next_closes(1);

    // Act
    let failed_start = consumer.test_client(true).start().await;
    broker.refuse_queue_deletes(false);
    let mut client = consumer.test_client(true);
    let second_start = client.start().await;

    // Assert
    assert!(matches!(failed_start, Err(ConsumerError::Scribe(_))));
    assert!(second_start.is_ok());
    client.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn a_consumer_cancelled_by_the_broker_shuts_down() {
    // Arrange
    let broker = InMemoryBroker::new();
    let in_key = queue_name("cancelled");
    let mut consumer = consumer(&broker);
    consumer
        .processor(
            ProcessorSettings::builder(&in_key)
                .handler(|_incoming| async { Ok::<_, anyhow::Error>(()) }),
        )
        .unwrap();
    let mut client = consumer.test_client(false);
    client.start().await.unwrap();
    let lifecycle = client.lifecycle().unwrap().clone();

    // Act
    // Deleting the queue cancels its consumers.
    client.scribe().unwrap().delete_queue(&in_key).await.unwrap();
    eventually(|| lifecycle.loop_stopped().is_set()).await;

    // Assert
    assert!(lifecycle.shutdown_signal().is_set());
    assert_eq!(broker.open_connections(), 0);
    client.stop().await.unwrap();
}
