//! The envelopes a processor works with: [`Incoming`] wraps the message it received,
//! [`Outgoing`] collects its reply.
mod incoming;
mod outgoing;

pub use incoming::Incoming;
pub use outgoing::{Media, Outgoing};
pub use crate::transport::Message;
