//! `spanconsumer` turns a RabbitMq connection into a declarative message-processing service,
//! built on top of [`lapin`].
//!
//! Register [`ProcessorSettings`](crate::consumers::ProcessorSettings) on a
//! [`Consumer`](crate::consumers::Consumer), each binding an async function to an input queue
//! (and optionally an output queue), then [`run`](crate::consumers::Consumer::run) it.
//! The consumer takes care of connecting, decoding message bodies, publishing replies,
//! acknowledging or rejecting messages, and shutting down gracefully.
//!
//! [`Scribe`](crate::scribe::Scribe) is the connection, channel and queue manager underneath.
//! It can be used on its own to publish messages.
//!
//! ## Testing
//!
//! [`InMemoryBroker`](crate::transport::memory::InMemoryBroker) stands in for RabbitMq and
//! [`Consumer::test_client`](crate::consumers::Consumer::test_client) drives a consumer from
//! within a test.

pub mod amqp;
pub mod codec;
pub mod consumers;
pub mod envelopes;
pub mod scribe;
pub mod transport;
