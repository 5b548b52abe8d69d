//! Helpers for connecting to a RabbitMq broker

pub mod configuration;
pub mod convenience;
mod factory;
pub use factory::{ConnectionFactory, ConnectionFactoryError};

pub use lapin::{options, types, BasicProperties};
