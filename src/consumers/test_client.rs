use crate::codec::{DataSchema, MimeType};
use crate::consumers::consumer::{start_in_background, Consumer};
use crate::consumers::error::ConsumerError;
use crate::consumers::lifecycle::Lifecycle;
use crate::envelopes::{Incoming, Media};
use crate::scribe::{Scribe, ScribeError};
use crate::transport::Confirmation;
use std::sync::Arc;

/// Drives a [`Consumer`] from within the runtime of a test.
///
/// Unlike [`Consumer::run`], the client neither blocks nor builds its own runtime: start it,
/// publish messages, pull what the processors published, then stop it.
///
/// ```rust,no_run
/// # async fn example(consumer: spanconsumer::consumers::Consumer) -> Result<(), anyhow::Error> {
/// use serde_json::json;
///
/// let mut client = consumer.test_client(true);
/// client.start().await?;
/// client.put_message("orders.in", json!({"qty": 3}), None).await?;
/// let reply = client.pull_message("orders.out", None, 10).await?;
/// assert_eq!(reply.media()?, Some(&json!({"qty": 6})));
/// client.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct TestClient<'a> {
    consumer: &'a Consumer,
    delete_queues: bool,
    lifecycle: Option<Arc<Lifecycle>>,
}

impl<'a> TestClient<'a> {
    pub(crate) fn new(consumer: &'a Consumer, delete_queues: bool) -> Self {
        Self {
            consumer,
            delete_queues,
            lifecycle: None,
        }
    }

    /// Start the consumer: connect, subscribe the processors and run the startup tasks.
    ///
    /// If the startup fails, the consumer is shut down and reset before the error is returned.
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        let lifecycle = self.consumer.create_lifecycle()?;
        self.lifecycle = Some(lifecycle.clone());

        if self.delete_queues {
            if let Err(e) = self.delete_processor_queues(lifecycle.scribe()).await {
                if let Err(close_error) = lifecycle.scribe().close_connection().await {
                    tracing::warn!(error = ?close_error, "Failed to close the connection");
                }
                self.stop().await?;
                return Err(e.into());
            }
        }

        let settings = Arc::new(self.consumer.settings().clone());
        if let Err(e) = start_in_background(settings, lifecycle).await {
            // The shutdown sequence is already under way.
            self.stop().await?;
            return Err(ConsumerError::Startup(e));
        }
        Ok(())
    }

    async fn delete_processor_queues(&self, scribe: &Scribe) -> Result<(), ScribeError> {
        scribe.connect().await?;
        for processor in self.consumer.settings().processors() {
            scribe.delete_queue(processor.in_key()).await?;
            if let Some(out_key) = processor.out_key() {
                scribe.delete_queue(out_key).await?;
            }
        }
        Ok(())
    }

    /// Publish `media` to `routing_key`. The mimetype defaults to JSON.
    pub async fn put_message(
        &self,
        routing_key: &str,
        media: impl Into<Media>,
        mimetype: Option<MimeType>,
    ) -> Result<Confirmation, ConsumerError> {
        let confirmation = self
            .scribe()?
            .publish(routing_key, media, mimetype, None)
            .await?;
        Ok(confirmation)
    }

    /// Pull a single message from `routing_key`, retrying empty reads `max_empty_retries` times.
    pub async fn pull_message(
        &self,
        routing_key: &str,
        schema: Option<Arc<dyn DataSchema>>,
        max_empty_retries: u32,
    ) -> Result<Incoming, ConsumerError> {
        let incoming = self
            .scribe()?
            .pull(routing_key, schema, max_empty_retries)
            .await?;
        Ok(incoming)
    }

    /// Shut the consumer down, wait for the shutdown sequence to finish and reset the consumer.
    pub async fn stop(&mut self) -> Result<(), ConsumerError> {
        let lifecycle = self.lifecycle.take().ok_or(ConsumerError::NotStarted)?;
        lifecycle.signal_shutdown();
        if let Some(shutdown) = lifecycle.take_shutdown_task() {
            if let Err(e) = shutdown.await {
                tracing::error!(error = ?e, "The shutdown task did not complete");
            }
        }
        lifecycle.shutdown_complete().set();
        self.consumer.reset()
    }

    /// The scribe of the running consumer.
    pub fn scribe(&self) -> Result<&Arc<Scribe>, ConsumerError> {
        self.lifecycle
            .as_ref()
            .map(|lifecycle| lifecycle.scribe())
            .ok_or(ConsumerError::NotStarted)
    }

    /// The lifecycle of the running consumer.
    pub fn lifecycle(&self) -> Option<&Arc<Lifecycle>> {
        self.lifecycle.as_ref()
    }
}
