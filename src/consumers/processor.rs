//! Processors bind a worker function to the queue it consumes from.
use crate::amqp::configuration::{ProcessingOptions, QueueOptions};
use crate::codec::{DataSchema, TypedSchema};
use crate::envelopes::{Incoming, Outgoing};
use anyhow::anyhow;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// The business logic run on each message delivered to a processor's input queue.
///
/// `outgoing` is `Some` if and only if the processor has an output queue.
/// Whatever the worker sets in `outgoing` is published to the output queue once it returns
/// successfully; if it sets nothing, nothing is published.
///
/// You will rarely implement `Worker` by hand: [`ProcessorBuilder::handler`] and
/// [`ReplyingProcessorBuilder::handler`] wrap async closures for you.
#[async_trait::async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn process(
        &self,
        incoming: Incoming,
        outgoing: Option<Outgoing>,
    ) -> Result<(), anyhow::Error>;
}

/// Adapts `async fn(Incoming) -> Result<(), E>` into a [`Worker`].
pub struct ClosureWorker<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, E> Worker for ClosureWorker<F>
where
    F: Fn(Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    async fn process(
        &self,
        incoming: Incoming,
        _outgoing: Option<Outgoing>,
    ) -> Result<(), anyhow::Error> {
        (self.0)(incoming).await.map_err(Into::into)
    }
}

/// Adapts `async fn(Incoming, Outgoing) -> Result<(), E>` into a [`Worker`].
pub struct ReplyingClosureWorker<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, E> Worker for ReplyingClosureWorker<F>
where
    F: Fn(Incoming, Outgoing) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    async fn process(
        &self,
        incoming: Incoming,
        outgoing: Option<Outgoing>,
    ) -> Result<(), anyhow::Error> {
        let outgoing =
            outgoing.ok_or_else(|| anyhow!("This worker expects an output queue to reply to"))?;
        (self.0)(incoming, outgoing).await.map_err(Into::into)
    }
}

/// A worker bound to its input queue, its optional output queue and their settings.
///
/// Build one with [`ProcessorSettings::builder`] and register it with
/// [`Consumer::processor`](super::Consumer::processor).
#[derive(Clone)]
pub struct ProcessorSettings {
    pub(crate) in_key: String,
    pub(crate) out_key: Option<String>,
    pub(crate) in_schema: Option<Arc<dyn DataSchema>>,
    pub(crate) out_schema: Option<Arc<dyn DataSchema>>,
    pub(crate) queue_options: Option<QueueOptions>,
    pub(crate) processing_options: ProcessingOptions,
    pub(crate) worker: Arc<dyn Worker>,
}

impl ProcessorSettings {
    /// Start building a processor consuming from `in_key`.
    pub fn builder(in_key: impl Into<String>) -> ProcessorBuilder {
        ProcessorBuilder {
            in_key: in_key.into(),
            in_schema: None,
            queue_options: None,
            processing_options: ProcessingOptions::default(),
        }
    }

    /// The queue this processor consumes from.
    pub fn in_key(&self) -> &str {
        &self.in_key
    }

    /// The queue replies are published to, if any.
    pub fn out_key(&self) -> Option<&str> {
        self.out_key.as_deref()
    }

    pub fn queue_options(&self) -> Option<&QueueOptions> {
        self.queue_options.as_ref()
    }

    pub fn processing_options(&self) -> &ProcessingOptions {
        &self.processing_options
    }

    pub fn in_schema(&self) -> Option<&Arc<dyn DataSchema>> {
        self.in_schema.as_ref()
    }

    pub fn out_schema(&self) -> Option<&Arc<dyn DataSchema>> {
        self.out_schema.as_ref()
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }
}

impl fmt::Debug for ProcessorSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorSettings")
            .field("in_key", &self.in_key)
            .field("out_key", &self.out_key)
            .field("queue_options", &self.queue_options)
            .field("processing_options", &self.processing_options)
            .finish()
    }
}

/// Builder for a processor that does not reply.
///
/// Call [`ProcessorBuilder::out_key`] to get a processor that replies on an output queue.
#[must_use]
pub struct ProcessorBuilder {
    in_key: String,
    in_schema: Option<Arc<dyn DataSchema>>,
    queue_options: Option<QueueOptions>,
    processing_options: ProcessingOptions,
}

impl ProcessorBuilder {
    /// Load incoming messages through `schema`.
    pub fn in_schema(mut self, schema: impl DataSchema) -> Self {
        self.in_schema = Some(Arc::new(schema));
        self
    }

    /// Load incoming messages through the `serde` type `T`.
    pub fn in_type<T: Serialize + DeserializeOwned + 'static>(self) -> Self {
        self.in_schema(TypedSchema::<T>::new())
    }

    /// Options used to declare the input queue.
    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = Some(options);
        self
    }

    pub fn processing_options(mut self, options: ProcessingOptions) -> Self {
        self.processing_options = options;
        self
    }

    /// Publish what the worker sets in its [`Outgoing`] to `out_key`.
    pub fn out_key(self, out_key: impl Into<String>) -> ReplyingProcessorBuilder {
        ReplyingProcessorBuilder {
            inner: self,
            out_key: out_key.into(),
            out_schema: None,
        }
    }

    /// Finish building the processor with an async closure as its worker.
    ///
    /// ```rust
    /// use spanconsumer::consumers::ProcessorSettings;
    ///
    /// let processor = ProcessorSettings::builder("audit.in").handler(|incoming| async move {
    ///     let _body = incoming.media()?;
    ///     Ok::<_, anyhow::Error>(())
    /// });
    /// assert_eq!(processor.in_key(), "audit.in");
    /// assert!(processor.out_key().is_none());
    /// ```
    pub fn handler<F, Fut, E>(self, handler: F) -> ProcessorSettings
    where
        F: Fn(Incoming) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.worker(ClosureWorker(handler))
    }

    /// Finish building the processor with a custom [`Worker`].
    pub fn worker(self, worker: impl Worker) -> ProcessorSettings {
        self.build(None, None, Arc::new(worker))
    }

    fn build(
        self,
        out_key: Option<String>,
        out_schema: Option<Arc<dyn DataSchema>>,
        worker: Arc<dyn Worker>,
    ) -> ProcessorSettings {
        ProcessorSettings {
            in_key: self.in_key,
            out_key,
            in_schema: self.in_schema,
            out_schema,
            queue_options: self.queue_options,
            processing_options: self.processing_options,
            worker,
        }
    }
}

/// Builder for a processor that publishes replies to an output queue.
#[must_use]
pub struct ReplyingProcessorBuilder {
    inner: ProcessorBuilder,
    out_key: String,
    out_schema: Option<Arc<dyn DataSchema>>,
}

impl ReplyingProcessorBuilder {
    pub fn in_schema(mut self, schema: impl DataSchema) -> Self {
        self.inner = self.inner.in_schema(schema);
        self
    }

    pub fn in_type<T: Serialize + DeserializeOwned + 'static>(mut self) -> Self {
        self.inner = self.inner.in_type::<T>();
        self
    }

    /// Dump replies through `schema` before encoding them.
    pub fn out_schema(mut self, schema: impl DataSchema) -> Self {
        self.out_schema = Some(Arc::new(schema));
        self
    }

    pub fn out_type<T: Serialize + DeserializeOwned + 'static>(self) -> Self {
        self.out_schema(TypedSchema::<T>::new())
    }

    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.inner = self.inner.queue_options(options);
        self
    }

    pub fn processing_options(mut self, options: ProcessingOptions) -> Self {
        self.inner = self.inner.processing_options(options);
        self
    }

    /// Finish building the processor with an async closure as its worker.
    ///
    /// ```rust
    /// use spanconsumer::consumers::ProcessorSettings;
    ///
    /// let processor = ProcessorSettings::builder("orders.in")
    ///     .out_key("orders.out")
    ///     .handler(|incoming, outgoing| async move {
    ///         if let Some(order) = incoming.media()? {
    ///             outgoing.set_media(order.clone());
    ///         }
    ///         Ok::<_, anyhow::Error>(())
    ///     });
    /// assert_eq!(processor.out_key(), Some("orders.out"));
    /// ```
    pub fn handler<F, Fut, E>(self, handler: F) -> ProcessorSettings
    where
        F: Fn(Incoming, Outgoing) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.worker(ReplyingClosureWorker(handler))
    }

    /// Finish building the processor with a custom [`Worker`].
    pub fn worker(self, worker: impl Worker) -> ProcessorSettings {
        self.inner
            .build(Some(self.out_key), self.out_schema, Arc::new(worker))
    }
}
