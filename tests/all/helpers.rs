use fake::faker::lorem::en::Word;
use fake::Fake;
use spanconsumer::amqp::configuration::ConnectionSettings;
use spanconsumer::consumers::Consumer;
use spanconsumer::transport::memory::InMemoryBroker;
use std::time::Duration;

/// A consumer with a random name, talking to `broker`.
pub fn consumer(broker: &InMemoryBroker) -> Consumer {
    let name: String = Word().fake();
    Consumer::new(ConnectionSettings::default())
        .with_name(format!("{name}-consumer"))
        .with_transport(broker.clone())
}

/// A queue name nobody else uses.
pub fn queue_name(prefix: &str) -> String {
    format!("{prefix}.{}", uuid::Uuid::new_v4())
}

/// Wait for `condition` to hold, checking every 10ms. Panics after 1000 checks.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("The condition was never met");
}
