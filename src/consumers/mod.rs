//! A declarative service consuming RabbitMq queues. Check out [`Consumer`] as a starting point.
pub use consumer::{Consumer, ConsumerSettings, DEFAULT_PREFETCH_COUNT};
pub use error::{ConsumerError, ConsumerStop, DispatchError, ProcessorError};
pub use lifecycle::{Event, Lifecycle};
pub use processor::{
    ClosureWorker, ProcessorBuilder, ProcessorSettings, ReplyingClosureWorker,
    ReplyingProcessorBuilder, Worker,
};
pub use tasks::{ErrorHandler, LifecycleTask};
pub use test_client::TestClient;

mod consumer;
mod dispatch;
mod error;
mod lifecycle;
mod processor;
mod tasks;
mod test_client;
