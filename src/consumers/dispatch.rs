//! The per-message pipeline and the consume loop feeding it.
use crate::amqp::configuration::ProcessOptions;
use crate::consumers::error::{ConsumerStop, DispatchError, ProcessorError};
use crate::consumers::lifecycle::Lifecycle;
use crate::consumers::processor::ProcessorSettings;
use crate::consumers::tasks::{panic_message, ErrorHandler};
use crate::envelopes::{Incoming, Outgoing};
use crate::scribe::Scribe;
use crate::transport::{Acker, Delivery, DeliveryStream, TransportError};
use anyhow::anyhow;
use futures_util::{stream::FuturesUnordered, FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// The error handlers shared by every processor of a consumer.
pub(crate) type ErrorHandlers = Arc<[Arc<dyn ErrorHandler>]>;

/// Consume `stream` on behalf of `processor` until a shutdown is signaled or the stream ends.
///
/// Each delivery is dispatched on its own task, so that a processor can work on as many
/// messages at once as the prefetch count allows. Dispatches in flight are awaited before
/// returning.
///
/// A stream that ends or fails signals the shutdown of the whole consumer.
#[tracing::instrument(
    name = "consume_loop",
    skip_all,
    fields(queue = %processor.in_key(), consumer = %lifecycle.name())
)]
pub(crate) async fn consume_until_shutdown(
    mut stream: DeliveryStream,
    processor: Arc<ProcessorSettings>,
    lifecycle: Arc<Lifecycle>,
    error_handlers: ErrorHandlers,
) {
    let mut task_handles = FuturesUnordered::new();
    let shutdown_signal = lifecycle.shutdown_signal().clone();
    let shutdown = shutdown_signal.wait();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Shutdowns take precedence over new deliveries.
            biased;

            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, no longer consuming");
                break;
            }

            Some(joined) = task_handles.next(), if !task_handles.is_empty() => {
                match joined {
                    Ok(Ok(())) => {}
                    // The signal was raised after the shutdown branch was polled.
                    Ok(Err(ConsumerStop)) => {
                        tracing::info!("A worker requested the consumer to stop");
                        break;
                    }
                    Err(e) => tracing::error!(error = ?e, "A dispatch task failed to complete"),
                }
            }

            delivery = stream.next() => {
                match delivery {
                    None => {
                        tracing::warn!("The broker cancelled the consumer, shutting down");
                        lifecycle.signal_shutdown();
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = ?e, "Lost the consumer stream, shutting down");
                        lifecycle.signal_shutdown();
                        break;
                    }
                    Some(Ok(delivery)) => {
                        let handle = tokio::spawn(dispatch(
                            processor.clone(),
                            lifecycle.clone(),
                            error_handlers.clone(),
                            delivery,
                        ));
                        task_handles.push(handle);
                    }
                }
            }
        }
    }

    // Deliveries still buffered in the stream go back to the queue when the connection closes.
    drop(stream);
    while let Some(joined) = task_handles.next().await {
        if let Err(e) = joined {
            tracing::error!(error = ?e, "A dispatch task failed to complete");
        }
    }
}

/// Run `processor` on a single delivery and settle the message with the broker.
///
/// Failures are reported to the error handlers and never escape. The only error is
/// [`ConsumerStop`], returned once the message is settled if a shutdown was signaled meanwhile.
#[tracing::instrument(
    name = "dispatch",
    skip_all,
    fields(queue = %processor.in_key(), delivery_tag = delivery.delivery_tag),
    level = "debug"
)]
pub(crate) async fn dispatch(
    processor: Arc<ProcessorSettings>,
    lifecycle: Arc<Lifecycle>,
    error_handlers: ErrorHandlers,
    delivery: Delivery,
) -> Result<(), ConsumerStop> {
    {
        let _worker = lifecycle.enter_worker();
        if let Err(e) = process_in_context(&processor, lifecycle.scribe(), delivery).await {
            handle_dispatch_error(e, &processor, &error_handlers).await;
        }
    }
    if lifecycle.shutdown_signal().is_set() {
        tracing::info!("Shutdown signaled, stopping the worker");
        return Err(ConsumerStop);
    }
    Ok(())
}

async fn process_in_context(
    processor: &ProcessorSettings,
    scribe: &Scribe,
    delivery: Delivery,
) -> Result<(), DispatchError> {
    let mut context = ProcessContext {
        acker: delivery.acker.clone(),
        redelivered: delivery.redelivered,
        options: processor.processing_options().process_options(),
    };
    let incoming = Incoming::new(delivery, processor.in_schema().cloned(), scribe.codecs().clone());

    let outcome = process_message(processor, scribe, &incoming).await;

    let give_up = outcome.is_err()
        && processor
            .processing_options()
            .is_final_delivery(incoming.delivery_count());
    let settled = if incoming.reject_requested() || give_up {
        if give_up {
            tracing::warn!(
                delivery_count = incoming.delivery_count(),
                "Final delivery attempt failed, rejecting the message"
            );
        }
        context.reject_now().await
    } else {
        Ok(())
    };
    let settled = match settled {
        Ok(()) => context.exit(outcome.is_ok()).await,
        Err(e) => Err(e),
    };

    match (outcome, settled) {
        (Err(e), Err(settle_error)) => {
            tracing::error!(error = ?settle_error, "Failed to settle a message after a failure");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Err(settle_error)) => Err(DispatchError::Settle(settle_error)),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Run the worker and publish its reply, if it set one.
async fn process_message(
    processor: &ProcessorSettings,
    scribe: &Scribe,
    incoming: &Incoming,
) -> Result<(), DispatchError> {
    let outgoing = match processor.out_key() {
        Some(out_key) => {
            scribe
                .get_queue(out_key, None)
                .await
                .map_err(DispatchError::Reply)?;
            Some(Outgoing::new(
                scribe.codecs().clone(),
                processor.out_schema().cloned(),
            ))
        }
        None => None,
    };

    let outcome = AssertUnwindSafe(
        processor
            .worker()
            .process(incoming.clone(), outgoing.clone()),
    )
    .catch_unwind()
    .await;
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(panic) => Some(anyhow!("The worker panicked: {}", panic_message(&*panic))),
    };
    if let Some(error) = error {
        return Err(ProcessorError {
            error,
            incoming: incoming.clone(),
            outgoing,
        }
        .into());
    }

    if let (Some(out_key), Some(outgoing)) = (processor.out_key(), &outgoing) {
        if outgoing.is_set() {
            scribe
                .publish_outgoing(out_key, outgoing)
                .await
                .map_err(DispatchError::Reply)?;
        }
    }
    Ok(())
}

/// Log `error`, then hand it to every error handler in turn.
async fn handle_dispatch_error(
    error: DispatchError,
    processor: &Arc<ProcessorSettings>,
    error_handlers: &[Arc<dyn ErrorHandler>],
) {
    match error.processor_error() {
        // The `Debug` output of `anyhow::Error` carries the whole chain of causes.
        Some(e) => tracing::error!(error = ?e.error, "The processor failed to handle a message"),
        None => tracing::error!(error = ?error, "Failed to dispatch a message"),
    }
    let error = Arc::new(error);
    for handler in error_handlers {
        let outcome = AssertUnwindSafe(handler.handle(error.clone(), processor.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(handler = %handler.name(), error = ?e, "Error handler failed")
            }
            Err(panic) => tracing::error!(
                handler = %handler.name(),
                "Error handler panicked: {}",
                panic_message(&*panic)
            ),
        }
    }
}

/// Settles a message once its processing is over, following the processor's [`ProcessOptions`].
struct ProcessContext {
    acker: Acker,
    redelivered: bool,
    options: ProcessOptions,
}

impl ProcessContext {
    /// Reject the message without requeueing it, ahead of [`ProcessContext::exit`].
    async fn reject_now(&mut self) -> Result<(), TransportError> {
        self.options.ignore_processed = true;
        self.acker.reject(false).await
    }

    async fn exit(&self, succeeded: bool) -> Result<(), TransportError> {
        if self.options.ignore_processed && self.acker.is_processed() {
            return Ok(());
        }
        if succeeded {
            self.acker.ack().await
        } else if self.options.reject_on_redelivered && self.redelivered {
            self.acker.reject(false).await
        } else {
            self.acker.reject(self.options.requeue).await
        }
    }
}
