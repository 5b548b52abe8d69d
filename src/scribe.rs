//! [`Scribe`] owns the connection to the broker for the duration of a consumer run.
use crate::amqp::configuration::{ConnectionSettings, QueueOptions};
use crate::codec::{CodecError, CodecRegistry, DataSchema, Decoder, Encoder, MimeType};
use crate::envelopes::{Incoming, Media, Message, Outgoing};
use crate::transport::{
    BrokerChannel, BrokerConnection, Confirmation, DeliveryStream, QueueInfo, Transport,
    TransportError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// How long to wait before trying to connect again after a failed attempt.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// How long [`Scribe::pull`] waits between two reads of an empty queue.
pub const PULL_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum ScribeError {
    #[error("Not connected to the message broker: call `connect` first")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Timed out while declaring queue '{queue}'")]
    DeclareTimeout { queue: String },
    #[error("The broker did not confirm the message published to '{routing_key}': {confirmation:?}")]
    ConfirmFailed {
        routing_key: String,
        confirmation: Confirmation,
    },
    #[error("Queue '{0}' is empty")]
    QueueEmpty(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Connection, channel and queue manager.
///
/// A `Scribe` holds at most one connection and one channel. Queues are declared at most once
/// per `Scribe`: later requests for the same queue are served from a cache.
///
/// It also owns the [`CodecRegistry`] used to encode and decode message bodies.
pub struct Scribe {
    settings: ConnectionSettings,
    transport: Arc<dyn Transport>,
    codecs: CodecRegistry,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    queues: tokio::sync::Mutex<HashMap<String, QueueInfo>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scribe {
    pub fn new(settings: ConnectionSettings, transport: Arc<dyn Transport>) -> Self {
        Self::with_codecs(settings, transport, CodecRegistry::default())
    }

    pub fn with_codecs(
        settings: ConnectionSettings,
        transport: Arc<dyn Transport>,
        codecs: CodecRegistry,
    ) -> Self {
        Self {
            settings,
            transport,
            codecs,
            connection: Mutex::new(None),
            channel: Mutex::new(None),
            queues: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Register the codec for `mimetype`. The last registration for a mimetype wins.
    pub fn register_mimetype(
        &mut self,
        mimetype: MimeType,
        encoder: impl Encoder,
        decoder: impl Decoder,
    ) {
        self.codecs.register(mimetype, encoder, decoder);
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.connection).is_some()
    }

    /// Connect to the broker.
    ///
    /// The broker being unreachable is treated as a transient condition: connection errors are
    /// logged and the attempt is repeated every [`CONNECT_RETRY_INTERVAL`], forever.
    /// Other errors are returned.
    #[tracing::instrument(name = "scribe_connect", skip(self), fields(host = %self.settings.host))]
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, ScribeError> {
        if let Some(connection) = lock(&self.connection).clone() {
            return Ok(connection);
        }
        loop {
            match self.transport.connect(&self.settings).await {
                Ok(connection) => {
                    info!("Connected to the message broker");
                    *lock(&self.connection) = Some(connection.clone());
                    return Ok(connection);
                }
                Err(e) if e.is_connection_error() => {
                    warn!(
                        error = ?e,
                        "Failed to connect to the message broker, retrying in {:?}",
                        CONNECT_RETRY_INTERVAL
                    );
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The channel of this `Scribe`, created on first use.
    ///
    /// Fails with [`ScribeError::NotConnected`] if [`Scribe::connect`] was never called.
    pub async fn get_channel(&self) -> Result<Arc<dyn BrokerChannel>, ScribeError> {
        if let Some(channel) = lock(&self.channel).clone() {
            return Ok(channel);
        }
        let connection = lock(&self.connection)
            .clone()
            .ok_or(ScribeError::NotConnected)?;
        let channel = connection.create_channel().await?;
        let mut slot = lock(&self.channel);
        // Another task may have raced us to it.
        Ok(slot.get_or_insert(channel).clone())
    }

    /// Limit how many unacknowledged messages the broker pushes to each consumer.
    pub async fn set_qos(&self, prefetch_count: u16) -> Result<(), ScribeError> {
        self.get_channel().await?.set_qos(prefetch_count).await?;
        Ok(())
    }

    /// Declare the queue for `routing_key`, unless it was already declared by this `Scribe`.
    ///
    /// The channel is created if it does not exist yet. Failed declarations are not retried.
    #[tracing::instrument(name = "scribe_get_queue", skip(self, options))]
    pub async fn get_queue(
        &self,
        routing_key: &str,
        options: Option<&QueueOptions>,
    ) -> Result<QueueInfo, ScribeError> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(routing_key) {
            return Ok(queue.clone());
        }
        let default_options = QueueOptions::default();
        let options = options.unwrap_or(&default_options);
        let channel = self.get_channel().await?;
        let declaration = channel.declare_queue(routing_key, options);
        let queue = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, declaration)
                .await
                .map_err(|_| ScribeError::DeclareTimeout {
                    queue: routing_key.to_owned(),
                })??,
            None => declaration.await?,
        };
        queues.insert(routing_key.to_owned(), queue.clone());
        Ok(queue)
    }

    /// Declare the queue for `routing_key` and start consuming from it.
    pub async fn consume(
        &self,
        routing_key: &str,
        options: Option<&QueueOptions>,
    ) -> Result<DeliveryStream, ScribeError> {
        self.get_queue(routing_key, options).await?;
        let consumer_tag = uuid::Uuid::new_v4().to_string();
        let stream = self
            .get_channel()
            .await?
            .consume(routing_key, &consumer_tag)
            .await?;
        Ok(stream)
    }

    /// Encode `media` and publish it to `routing_key`.
    ///
    /// The mimetype defaults to JSON. Pre-built messages are published as they are.
    pub async fn publish(
        &self,
        routing_key: &str,
        media: impl Into<Media>,
        mimetype: Option<MimeType>,
        schema: Option<Arc<dyn DataSchema>>,
    ) -> Result<Confirmation, ScribeError> {
        let outgoing = Outgoing::new(self.codecs.clone(), schema);
        outgoing.set(media.into());
        if let Some(mimetype) = mimetype {
            outgoing.set_mimetype(mimetype);
        }
        self.publish_outgoing(routing_key, &outgoing).await
    }

    /// Publish the reply held by `outgoing` to `routing_key`.
    pub async fn publish_outgoing(
        &self,
        routing_key: &str,
        outgoing: &Outgoing,
    ) -> Result<Confirmation, ScribeError> {
        let message = outgoing.generate_message()?;
        self.publish_message(routing_key, message).await
    }

    /// Publish `message` to `routing_key` through the default exchange.
    ///
    /// The queue is declared first if needed. Anything but a positive confirmation from the
    /// broker is an error.
    #[tracing::instrument(name = "scribe_publish", skip(self, message), level = "debug")]
    pub async fn publish_message(
        &self,
        routing_key: &str,
        message: Message,
    ) -> Result<Confirmation, ScribeError> {
        self.get_queue(routing_key, None).await?;
        let confirmation = self.get_channel().await?.publish(routing_key, message).await?;
        if !confirmation.is_ack() {
            return Err(ScribeError::ConfirmFailed {
                routing_key: routing_key.to_owned(),
                confirmation,
            });
        }
        Ok(confirmation)
    }

    /// Fetch a single message from `routing_key`, acking it straight away.
    ///
    /// Empty reads are retried every [`PULL_RETRY_INTERVAL`], `max_empty_retries` times.
    /// Meant for tests: production code should consume queues through a
    /// [`Consumer`](crate::consumers::Consumer).
    pub async fn pull(
        &self,
        routing_key: &str,
        schema: Option<Arc<dyn DataSchema>>,
        max_empty_retries: u32,
    ) -> Result<Incoming, ScribeError> {
        self.get_queue(routing_key, None).await?;
        let channel = self.get_channel().await?;
        for attempt in 0..=max_empty_retries {
            if let Some(delivery) = channel.get(routing_key).await? {
                delivery.acker.ack().await?;
                return Ok(Incoming::new(delivery, schema, self.codecs.clone()));
            }
            if attempt < max_empty_retries {
                tokio::time::sleep(PULL_RETRY_INTERVAL).await;
            }
        }
        Err(ScribeError::QueueEmpty(routing_key.to_owned()))
    }

    /// Delete the queue for `routing_key`, with all its messages.
    pub async fn delete_queue(&self, routing_key: &str) -> Result<(), ScribeError> {
        let mut queues = self.queues.lock().await;
        self.get_channel().await?.delete_queue(routing_key).await?;
        queues.remove(routing_key);
        Ok(())
    }

    /// Close the connection, if open. Unacknowledged messages go back to their queues.
    #[tracing::instrument(name = "scribe_close", skip(self))]
    pub async fn close_connection(&self) -> Result<(), ScribeError> {
        lock(&self.channel).take();
        let connection = lock(&self.connection).take();
        self.queues.lock().await.clear();
        if let Some(connection) = connection {
            connection.close().await?;
        }
        Ok(())
    }
}
