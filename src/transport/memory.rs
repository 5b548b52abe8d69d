//! An in-process message broker.
//!
//! [`InMemoryBroker`] mimics the subset of RabbitMq behaviour a consumer service relies on:
//! FIFO queues behind the default exchange, round-robin delivery to consumers bounded by their
//! prefetch count, requeueing and dead-lettering on reject, requeueing of unacknowledged messages
//! when a connection closes, and `x-delivery-count` tracking on quorum queues.
//!
//! It is meant for tests: faults can be injected and the state of every queue inspected.
use crate::amqp::configuration::{ConnectionSettings, QueueOptions};
use crate::amqp::convenience::set_header;
use crate::amqp::types::AMQPValue;
use crate::amqp::BasicProperties;
use crate::transport::{
    AckBackend, Acker, BrokerChannel, BrokerConnection, Confirmation, Delivery, DeliveryStream,
    Message, QueueInfo, Transport, TransportError, DELIVERY_COUNT_HEADER,
};
use anyhow::anyhow;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

const NO_ROUTE: u16 = 312;

/// A message sitting in an [`InMemoryBroker`] queue.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
    /// How many times the message was delivered and then returned to the queue.
    pub delivery_count: u32,
}

/// A broker living in the memory of the current process.
///
/// Cloning an `InMemoryBroker` gives another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    open_connections: HashSet<u64>,
    next_id: u64,
    next_delivery_tag: u64,
    connections_opened: usize,
    failing_connections: usize,
    failing_closes: usize,
    refuse_confirms: bool,
    refuse_deletes: bool,
}

struct MemoryQueue {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
    acked: Vec<StoredMessage>,
    dead_letters: Vec<StoredMessage>,
}

struct Unacked {
    message: StoredMessage,
    connection_id: u64,
    consumer_tag: Option<String>,
}

struct MemoryConsumer {
    tag: String,
    connection_id: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

enum Outcome {
    Ack,
    Reject { requeue: bool },
}

impl MemoryQueue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            acked: Vec::new(),
            dead_letters: Vec::new(),
        }
    }

    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_owned(),
            message_count: u32::try_from(self.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(self.consumers.len()).unwrap_or(u32::MAX),
        }
    }

    /// Round-robin over the consumers that have not reached their prefetch limit.
    fn next_consumer(&mut self) -> Option<usize> {
        let n_consumers = self.consumers.len();
        for offset in 0..n_consumers {
            let index = (self.next_consumer + offset) % n_consumers;
            let consumer = &self.consumers[index];
            if consumer.prefetch == 0 || consumer.in_flight < usize::from(consumer.prefetch) {
                self.next_consumer = (index + 1) % n_consumers;
                return Some(index);
            }
        }
        None
    }

    fn requeue(&mut self, mut message: StoredMessage) {
        message.delivery_count += 1;
        self.ready.push_front(message);
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `n` connection attempts fail with a transient connection error.
    pub fn fail_next_connections(&self, n: usize) {
        self.lock().failing_connections = n;
    }

    /// The next `n` attempts to close a connection fail, leaving the connection open.
    pub fn fail_next_closes(&self, n: usize) {
        self.lock().failing_closes = n;
    }

    /// When `true`, queue deletions are refused.
    pub fn refuse_queue_deletes(&self, refuse: bool) {
        self.lock().refuse_deletes = refuse;
    }

    /// When `true`, publishes are negatively acknowledged and the messages are dropped.
    pub fn refuse_publish_confirms(&self, refuse: bool) {
        self.lock().refuse_confirms = refuse;
    }

    /// How many connections were successfully opened so far.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// How many connections are currently open.
    pub fn open_connections(&self) -> usize {
        self.lock().open_connections.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Number of messages waiting to be delivered.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Number of messages delivered but not yet acked or rejected.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Messages that were acked, in acknowledgement order.
    pub fn acked(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.acked.clone())
            .unwrap_or_default()
    }

    /// Messages that were rejected without requeueing, in rejection order.
    pub fn dead_letters(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Push ready messages to the consumers of `queue_name` until they are all busy.
    fn dispatch(&self, state: &mut BrokerState, queue_name: &str) {
        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = state;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        while !queue.ready.is_empty() {
            let Some(index) = queue.next_consumer() else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            *next_delivery_tag += 1;
            let tag = *next_delivery_tag;
            let delivery = self.delivery(queue_name, tag, queue.options.is_quorum(), &message);
            let consumer = &mut queue.consumers[index];
            if consumer.sender.send(delivery).is_err() {
                // The consumer stream was dropped.
                queue.consumers.remove(index);
                queue.next_consumer = 0;
                queue.ready.push_front(message);
                continue;
            }
            consumer.in_flight += 1;
            let unacked = Unacked {
                message,
                connection_id: consumer.connection_id,
                consumer_tag: Some(consumer.tag.clone()),
            };
            queue.unacked.insert(tag, unacked);
        }
    }

    fn delivery(
        &self,
        queue_name: &str,
        delivery_tag: u64,
        tracks_delivery_count: bool,
        message: &StoredMessage,
    ) -> Delivery {
        let mut properties = message.properties.clone();
        if tracks_delivery_count && message.delivery_count > 0 {
            properties = set_header(
                properties,
                DELIVERY_COUNT_HEADER,
                AMQPValue::LongLongInt(i64::from(message.delivery_count)),
            );
        }
        Delivery {
            delivery_tag,
            routing_key: queue_name.to_owned(),
            redelivered: message.delivery_count > 0,
            properties,
            data: message.payload.clone(),
            acker: Acker::new(MemoryAcker {
                state: Arc::downgrade(&self.state),
                queue: queue_name.to_owned(),
                delivery_tag,
            }),
        }
    }

    fn settle(
        &self,
        queue_name: &str,
        delivery_tag: u64,
        outcome: Outcome,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let queue = state.queues.get_mut(queue_name).ok_or_else(|| {
            TransportError::Broker(anyhow!("NOT_FOUND - no queue '{}'", queue_name))
        })?;
        let unacked = queue
            .unacked
            .remove(&delivery_tag)
            .ok_or(TransportError::Closed)?;
        if let Some(tag) = &unacked.consumer_tag {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| &c.tag == tag) {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }
        match outcome {
            Outcome::Ack => queue.acked.push(unacked.message),
            Outcome::Reject { requeue: true } => queue.requeue(unacked.message),
            Outcome::Reject { requeue: false } => queue.dead_letters.push(unacked.message),
        }
        self.dispatch(&mut state, queue_name);
        Ok(())
    }

    fn close_connection(&self, connection_id: u64) {
        let mut state = self.lock();
        if !state.open_connections.remove(&connection_id) {
            return;
        }
        let mut touched = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            queue.consumers.retain(|c| c.connection_id != connection_id);
            queue.next_consumer = 0;
            let mut returned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.connection_id == connection_id)
                .map(|(tag, _)| *tag)
                .collect();
            // Oldest delivery ends up at the front of the queue.
            returned.sort_unstable_by(|a, b| b.cmp(a));
            for tag in returned {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    queue.requeue(unacked.message);
                }
            }
            touched.push(name.clone());
        }
        for name in touched {
            self.dispatch(&mut state, &name);
        }
    }

    fn ensure_open(&self, state: &BrokerState, connection_id: u64) -> Result<(), TransportError> {
        if state.open_connections.contains(&connection_id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryBroker {
    async fn connect(
        &self,
        _settings: &ConnectionSettings,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let mut state = self.lock();
        if state.failing_connections > 0 {
            state.failing_connections -= 1;
            return Err(TransportError::Connection(anyhow!("Connection refused")));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.open_connections.insert(id);
        state.connections_opened += 1;
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let state = self.broker.lock();
        self.broker.ensure_open(&state, self.id)?;
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.broker.lock();
            if state.failing_closes > 0 {
                state.failing_closes -= 1;
                return Err(TransportError::Connection(anyhow!("Connection reset by peer")));
            }
        }
        self.broker.close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    connection_id: u64,
    prefetch: AtomicU16,
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        let state = self.broker.lock();
        self.broker.ensure_open(&state, self.connection_id)?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let mut state = self.broker.lock();
        self.broker.ensure_open(&state, self.connection_id)?;
        let existing = state
            .queues
            .get(name)
            .map(|queue| (queue.options.durable, queue.info(name)));
        match existing {
            Some((durable, _)) if !options.passive && durable != options.durable => {
                Err(TransportError::Broker(anyhow!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    name
                )))
            }
            Some((_, info)) => Ok(info),
            None if options.passive => Err(TransportError::Broker(anyhow!(
                "NOT_FOUND - no queue '{}'",
                name
            ))),
            None => {
                let queue = MemoryQueue::new(options.clone());
                let info = queue.info(name);
                state.queues.insert(name.to_owned(), queue);
                Ok(info)
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        self.broker.ensure_open(&state, self.connection_id)?;
        if state.refuse_deletes {
            return Err(TransportError::Broker(anyhow!(
                "ACCESS_REFUSED - cannot delete queue '{}'",
                name
            )));
        }
        state.queues.remove(name);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.lock();
            self.broker.ensure_open(&state, self.connection_id)?;
            let memory_queue = state.queues.get_mut(queue).ok_or_else(|| {
                TransportError::Broker(anyhow!("NOT_FOUND - no queue '{}'", queue))
            })?;
            memory_queue.consumers.push(MemoryConsumer {
                tag: consumer_tag.to_owned(),
                connection_id: self.connection_id,
                prefetch: self.prefetch.load(Ordering::SeqCst),
                in_flight: 0,
                sender,
            });
            self.broker.dispatch(&mut state, queue);
        }
        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            let delivery = receiver.recv().await?;
            Some((Ok(delivery), receiver))
        });
        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: Message,
    ) -> Result<Confirmation, TransportError> {
        let mut state = self.broker.lock();
        self.broker.ensure_open(&state, self.connection_id)?;
        if state.refuse_confirms {
            return Ok(Confirmation::Nack);
        }
        let Some(queue) = state.queues.get_mut(routing_key) else {
            return Ok(Confirmation::Unroutable {
                reply_code: NO_ROUTE,
            });
        };
        queue.ready.push_back(StoredMessage {
            payload: message.payload,
            properties: message.properties,
            delivery_count: 0,
        });
        self.broker.dispatch(&mut state, routing_key);
        Ok(Confirmation::Ack)
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        let mut state = self.broker.lock();
        self.broker.ensure_open(&state, self.connection_id)?;
        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = &mut *state;
        let memory_queue = queues.get_mut(queue).ok_or_else(|| {
            TransportError::Broker(anyhow!("NOT_FOUND - no queue '{}'", queue))
        })?;
        let Some(message) = memory_queue.ready.pop_front() else {
            return Ok(None);
        };
        *next_delivery_tag += 1;
        let tag = *next_delivery_tag;
        let delivery =
            self.broker
                .delivery(queue, tag, memory_queue.options.is_quorum(), &message);
        memory_queue.unacked.insert(
            tag,
            Unacked {
                message,
                connection_id: self.connection_id,
                consumer_tag: None,
            },
        );
        Ok(Some(delivery))
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Outcome) -> Result<(), TransportError> {
        let state = self.state.upgrade().ok_or(TransportError::Closed)?;
        InMemoryBroker { state }.settle(&self.queue, self.delivery_tag, outcome)
    }
}

#[async_trait::async_trait]
impl AckBackend for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(Outcome::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(Outcome::Reject { requeue })
    }
}
