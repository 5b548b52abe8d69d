//! [`Transport`] implementation talking to a RabbitMq broker via [`lapin`].
use crate::amqp::configuration::{ConnectionSettings, QueueOptions};
use crate::amqp::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use crate::amqp::types::FieldTable;
use crate::amqp::{ConnectionFactory, ConnectionFactoryError};
use crate::transport::{
    AckBackend, Acker, BrokerChannel, BrokerConnection, Confirmation, Delivery, DeliveryStream,
    Message, QueueInfo, Transport, TransportError,
};
use futures_util::StreamExt;
use std::sync::Arc;

// Reply Code 312 - NO_ROUTE
// See https://www.rabbitmq.com/amqp-0-9-1-reference.html
const NO_ROUTE: u16 = 312;

/// Connects to RabbitMq using a [`ConnectionFactory`].
#[derive(Clone, Debug, Default)]
pub struct AmqpTransport;

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let factory = ConnectionFactory::new_from_config(settings).map_err(|e| match e {
            ConnectionFactoryError::Tls(e) => TransportError::Configuration(e),
            e => TransportError::Connection(e.into()),
        })?;
        let connection = factory
            .new_connection()
            .await
            .map_err(|e| TransportError::Connection(e.into()))?;
        Ok(Arc::new(AmqpConnection(connection)))
    }
}

/// A wrapper around [`lapin::Connection`].
pub struct AmqpConnection(lapin::Connection);

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self.0.create_channel().await.map_err(map_lapin_error)?;
        // Enable publish confirms on the channel
        // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(map_lapin_error)?;
        Ok(Arc::new(AmqpChannel(channel)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.0.close(200, "OK").await.map_err(map_lapin_error)
    }
}

/// A wrapper around [`lapin::Channel`], with publisher confirmation enabled.
pub struct AmqpChannel(lapin::Channel);

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.0
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self, options))]
    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let declare_options = QueueDeclareOptions {
            passive: options.passive,
            durable: options.durable,
            exclusive: false,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        let queue = self
            .0
            .queue_declare(name, declare_options, options.arguments.clone())
            .await
            .map_err(map_lapin_error)?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    #[tracing::instrument(name = "rabbitmq_delete_queue", skip(self))]
    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        self.0
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(map_lapin_error)?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip(self))]
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .0
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;
        let stream = consumer.map(|delivery| delivery.map(from_lapin).map_err(map_lapin_error));
        Ok(stream.boxed())
    }

    #[tracing::instrument(level = "debug", name = "rabbitmq_publish", skip(self, message))]
    async fn publish(
        &self,
        routing_key: &str,
        message: Message,
    ) -> Result<Confirmation, TransportError> {
        let options = BasicPublishOptions {
            // Unroutable messages are returned to us rather than silently dropped.
            mandatory: true,
            // The immediate flag was dropped in RabbitMQ 3.0 - setting it causes a not-supported error
            immediate: false,
        };
        let confirm = self
            .0
            .basic_publish(
                "",
                routing_key,
                options,
                &message.payload,
                message.properties,
            )
            .await
            .map_err(map_lapin_error)?
            .await
            .map_err(map_lapin_error)?;
        let confirmation = match confirm {
            lapin::publisher_confirm::Confirmation::Ack(Some(returned))
                if returned.reply_code == NO_ROUTE =>
            {
                Confirmation::Unroutable {
                    reply_code: returned.reply_code,
                }
            }
            lapin::publisher_confirm::Confirmation::Ack(_) => Confirmation::Ack,
            lapin::publisher_confirm::Confirmation::Nack(_)
            | lapin::publisher_confirm::Confirmation::NotRequested => Confirmation::Nack,
        };
        Ok(confirmation)
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        let message = self
            .0
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(map_lapin_error)?;
        Ok(message.map(|m| from_lapin(m.delivery)))
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl AckBackend for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(map_lapin_error)
    }
}

fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: delivery.properties,
        data: delivery.data,
        acker: Acker::new(LapinAcker(delivery.acker)),
    }
}

fn map_lapin_error(e: lapin::Error) -> TransportError {
    match e {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => TransportError::Connection(e.into()),
        e => TransportError::Broker(e.into()),
    }
}
