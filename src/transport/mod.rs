//! The narrow interface between the consumer service and the message broker.
//!
//! The service never talks to `lapin` directly: it goes through [`Transport`],
//! [`BrokerConnection`] and [`BrokerChannel`].
//! [`rabbit_mq::AmqpTransport`] is the production implementation, [`memory::InMemoryBroker`]
//! an in-process broker used to exercise consumers without a running RabbitMq instance.
use crate::amqp::configuration::{ConnectionSettings, QueueOptions};
use crate::amqp::BasicProperties;
use futures_util::stream::BoxStream;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod memory;
pub mod rabbit_mq;

/// The header in which quorum queues track how many times a message was delivered before.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// A stream of messages pushed by the broker to a queue consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Errors returned by a broker transport.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The broker could not be reached. Connection errors are considered transient.
    #[error("Failed to connect to the message broker")]
    Connection(#[source] anyhow::Error),
    /// The transport is misconfigured - retrying will not help.
    #[error("The broker transport is misconfigured")]
    Configuration(#[source] anyhow::Error),
    /// The connection or channel has been closed.
    #[error("The connection to the message broker is closed")]
    Closed,
    /// The broker refused to carry out the requested operation.
    #[error("The message broker refused the operation")]
    Broker(#[source] anyhow::Error),
    /// The message has already been acked or rejected.
    #[error("The message has already been acked or rejected")]
    AlreadyProcessed,
}

impl TransportError {
    /// `true` if retrying to connect might succeed.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Opens connections to a message broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection. Safe to call again after a failed attempt.
    async fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// An open connection to a message broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Open a new channel on this connection.
    ///
    /// Publisher confirmations are enabled on the channel.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Close the connection. Unacknowledged messages go back to their queues.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Limit the number of unacknowledged messages pushed to each consumer on this channel.
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    /// Declare a queue, returning its current state.
    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError>;

    /// Delete a queue and all the messages it holds.
    async fn delete_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Start consuming messages from a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, TransportError>;

    /// Publish a message to a queue through the default exchange, waiting for the broker
    /// confirmation.
    async fn publish(
        &self,
        routing_key: &str,
        message: Message,
    ) -> Result<Confirmation, TransportError>;

    /// Fetch a single message from a queue, if one is ready.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, TransportError>;
}

/// The state of a queue as reported by the broker when it was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// What the broker answered to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// The message could not be routed to any queue.
    Unroutable { reply_code: u16 },
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }
}

/// A message ready to be published: an encoded payload and its AMQP properties.
#[derive(Clone, Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>, properties: BasicProperties) -> Self {
        Self {
            payload: payload.into(),
            properties,
        }
    }
}

/// A message pushed by the broker.
pub struct Delivery {
    /// The delivery tag of the message on its channel.
    pub delivery_tag: u64,
    /// The routing key the message was published with.
    pub routing_key: String,
    /// Whether this message was delivered before.
    pub redelivered: bool,
    /// Contains the properties and the headers of the message.
    pub properties: BasicProperties,
    /// The payload of the message in binary format.
    pub data: Vec<u8>,
    // Hidden from the public interface, to stop a message being acked or rejected by
    // processors behind the back of the dispatch pipeline.
    pub(crate) acker: Acker,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: String,
        redelivered: bool,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Acker,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data_len", &self.data.len())
            .field("processed", &self.acker.is_processed())
            .finish()
    }
}

/// The transport-specific half of an [`Acker`].
#[async_trait::async_trait]
pub trait AckBackend: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// Acks or rejects a [`Delivery`] with the broker.
///
/// AMQP forbids settling a message twice: the acker remembers whether the message has been
/// processed already and refuses a second attempt with [`TransportError::AlreadyProcessed`].
#[derive(Clone)]
pub struct Acker {
    inner: Arc<AckerInner>,
}

struct AckerInner {
    backend: Box<dyn AckBackend>,
    processed: AtomicBool,
}

impl Acker {
    pub fn new(backend: impl AckBackend) -> Self {
        Self {
            inner: Arc::new(AckerInner {
                backend: Box::new(backend),
                processed: AtomicBool::new(false),
            }),
        }
    }

    /// `true` once the message has been acked or rejected.
    pub fn is_processed(&self) -> bool {
        self.inner.processed.load(Ordering::SeqCst)
    }

    fn mark_processed(&self) -> Result<(), TransportError> {
        if self.inner.processed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyProcessed);
        }
        Ok(())
    }

    /// Positive acknowledgement - the message is removed from the queue.
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.mark_processed()?;
        self.inner.backend.ack().await
    }

    /// Negative acknowledgement. The message goes back to the queue if `requeue` is `true`,
    /// to the dead letter exchange (if any) otherwise.
    pub async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.mark_processed()?;
        self.inner.backend.reject(requeue).await
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("processed", &self.is_processed())
            .finish()
    }
}
