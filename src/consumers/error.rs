use crate::envelopes::{Incoming, Outgoing};
use crate::scribe::ScribeError;
use crate::transport::TransportError;

/// Errors returned by [`Consumer`](super::Consumer)'s public methods.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("A processor is already registered for queue '{0}'")]
    DuplicateProcessor(String),
    #[error("The consumer has not been started")]
    NotStarted,
    #[error("The consumer cannot be reset before its shutdown is complete")]
    NotShutDown,
    #[error("The consumer was already started: reset it before starting it again")]
    LifecycleActive,
    #[error("The consumer failed to start up")]
    Startup(#[source] anyhow::Error),
    #[error("Failed to build the async runtime")]
    Runtime(#[source] std::io::Error),
    #[error(transparent)]
    Scribe(#[from] ScribeError),
}

/// A processor failed to handle a message.
///
/// It carries the envelopes the processor was working with, so that error handlers
/// can inspect the message that caused the failure.
#[derive(thiserror::Error, Debug)]
#[error("The processor for queue '{}' failed to handle a message", .incoming.routing_key())]
pub struct ProcessorError {
    #[source]
    pub error: anyhow::Error,
    pub incoming: Incoming,
    pub outgoing: Option<Outgoing>,
}

/// Everything that can go wrong while dispatching a message to its processor.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    /// The output queue could not be declared or the reply could not be published.
    #[error("Failed to deliver the reply of a processor")]
    Reply(#[source] ScribeError),
    /// The message could not be acked or rejected.
    #[error("Failed to settle a message with the broker")]
    Settle(#[source] TransportError),
}

impl DispatchError {
    /// The processor failure, if this is one.
    pub fn processor_error(&self) -> Option<&ProcessorError> {
        match self {
            Self::Processor(e) => Some(e),
            _ => None,
        }
    }
}

/// Raised by a worker that noticed a shutdown request after finishing its message.
///
/// This is how consume loops learn that they should stop: it is not reported to error handlers.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Consumer stop requested")]
pub struct ConsumerStop;
