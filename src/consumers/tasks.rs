//! Hooks run by a [`Consumer`](super::Consumer) around its lifecycle and its failures.
use crate::consumers::error::DispatchError;
use crate::consumers::lifecycle::Lifecycle;
use crate::consumers::processor::ProcessorSettings;
use anyhow::anyhow;
use futures_util::FutureExt;
use std::any::Any;
use std::borrow::Cow;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A task run once the consumer is connected (startup task) or once it has stopped
/// consuming (shutdown task).
///
/// Startup tasks run in registration order: the first failure aborts the startup.
/// Shutdown tasks also run in registration order, but a failure is logged and the next task
/// runs anyway.
///
/// Implemented for all async closures taking an `Arc<Lifecycle>`.
#[async_trait::async_trait]
pub trait LifecycleTask: Send + Sync + 'static {
    /// A name for the task, used in logs.
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    async fn run(&self, lifecycle: Arc<Lifecycle>) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<F, Fut, E> LifecycleTask for F
where
    F: Fn(Arc<Lifecycle>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    async fn run(&self, lifecycle: Arc<Lifecycle>) -> Result<(), anyhow::Error> {
        self(lifecycle).await.map_err(Into::into)
    }
}

/// Run `task`, turning a panic into an error.
pub(crate) async fn run_task(
    task: &dyn LifecycleTask,
    lifecycle: Arc<Lifecycle>,
) -> Result<(), anyhow::Error> {
    match AssertUnwindSafe(task.run(lifecycle)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(anyhow!("The task panicked: {}", panic_message(&*panic))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Observes failures that happen while dispatching messages to processors.
///
/// Error handlers cannot change what happens to the message: it has already been requeued
/// or rejected according to the processor's options. A failing handler is logged and does not
/// stop the next handlers from running.
///
/// Implemented for all async closures with a matching signature.
#[async_trait::async_trait]
pub trait ErrorHandler: Send + Sync + 'static {
    /// A name for the handler, used in logs.
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    async fn handle(
        &self,
        error: Arc<DispatchError>,
        processor: Arc<ProcessorSettings>,
    ) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<F, Fut, E> ErrorHandler for F
where
    F: Fn(Arc<DispatchError>, Arc<ProcessorSettings>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    async fn handle(
        &self,
        error: Arc<DispatchError>,
        processor: Arc<ProcessorSettings>,
    ) -> Result<(), anyhow::Error> {
        self(error, processor).await.map_err(Into::into)
    }
}
