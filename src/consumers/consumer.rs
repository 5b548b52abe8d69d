use crate::amqp::configuration::ConnectionSettings;
use crate::codec::{CodecRegistry, Decoder, Encoder, MimeType};
use crate::consumers::dispatch::{consume_until_shutdown, ErrorHandlers};
use crate::consumers::error::ConsumerError;
use crate::consumers::lifecycle::Lifecycle;
use crate::consumers::processor::ProcessorSettings;
use crate::consumers::tasks::{run_task, ErrorHandler, LifecycleTask};
use crate::consumers::test_client::TestClient;
use crate::scribe::Scribe;
use crate::transport::rabbit_mq::AmqpTransport;
use crate::transport::Transport;
use shutdown_handler::ShutdownHandler;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The default number of unacknowledged messages the broker pushes to each processor.
pub const DEFAULT_PREFETCH_COUNT: u16 = 100;

/// Everything a [`Consumer`] is configured with.
///
/// Settings only change during the registration phase. Each run works on its own snapshot.
#[derive(Clone)]
pub struct ConsumerSettings {
    pub name: String,
    pub connection: ConnectionSettings,
    pub prefetch_count: u16,
    pub(crate) startup_tasks: Vec<Arc<dyn LifecycleTask>>,
    pub(crate) shutdown_tasks: Vec<Arc<dyn LifecycleTask>>,
    pub(crate) error_handlers: Vec<Arc<dyn ErrorHandler>>,
    pub(crate) processors: BTreeMap<String, Arc<ProcessorSettings>>,
    pub(crate) codecs: CodecRegistry,
}

impl ConsumerSettings {
    pub fn new(connection: ConnectionSettings) -> Self {
        Self {
            name: uuid::Uuid::new_v4().to_string(),
            connection,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            startup_tasks: Vec::new(),
            shutdown_tasks: Vec::new(),
            error_handlers: Vec::new(),
            processors: BTreeMap::new(),
            codecs: CodecRegistry::default(),
        }
    }

    /// The registered processors, keyed by input queue.
    pub fn processors(&self) -> impl Iterator<Item = &Arc<ProcessorSettings>> {
        self.processors.values()
    }
}

impl std::fmt::Debug for ConsumerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSettings")
            .field("name", &self.name)
            .field("connection", &self.connection)
            .field("prefetch_count", &self.prefetch_count)
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("startup_tasks", &self.startup_tasks.len())
            .field("shutdown_tasks", &self.shutdown_tasks.len())
            .field("error_handlers", &self.error_handlers.len())
            .finish()
    }
}

/// A service consuming messages from RabbitMq queues.
///
/// # Registration
///
/// Processors, codecs, error handlers and lifecycle tasks are registered before the consumer
/// is started. Each input queue can only have one processor.
///
/// ```rust,no_run
/// use spanconsumer::amqp::configuration::ConnectionSettings;
/// use spanconsumer::consumers::{Consumer, ProcessorSettings};
///
/// let mut consumer = Consumer::new(ConnectionSettings::default()).with_name("orders");
/// consumer
///     .processor(
///         ProcessorSettings::builder("orders.in")
///             .out_key("orders.out")
///             .handler(|incoming, outgoing| async move {
///                 if let Some(order) = incoming.media()? {
///                     outgoing.set_media(order.clone());
///                 }
///                 Ok::<_, anyhow::Error>(())
///             }),
///     )
///     .unwrap();
/// // Blocks until Ctrl-C, SIGTERM or `signal_shutdown`.
/// consumer.run().unwrap();
/// ```
///
/// # Lifecycle
///
/// [`Consumer::run`] connects, subscribes every processor to its queue, runs the startup tasks
/// and then consumes until a shutdown is signaled. The shutdown lets in-flight messages finish,
/// runs the shutdown tasks and closes the connection.
///
/// A consumer that ran has to be [`reset`](Consumer::reset) before it can run again.
pub struct Consumer {
    settings: ConsumerSettings,
    transport: Arc<dyn Transport>,
    lifecycle: Mutex<Option<Arc<Lifecycle>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Consumer {
    pub fn new(connection: ConnectionSettings) -> Self {
        Self::from_settings(ConsumerSettings::new(connection))
    }

    pub fn from_settings(settings: ConsumerSettings) -> Self {
        Self {
            settings,
            transport: Arc::new(AmqpTransport),
            lifecycle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = name.into();
        self
    }

    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.settings.prefetch_count = prefetch_count;
        self
    }

    /// Talk to the broker through `transport` instead of AMQP.
    #[must_use]
    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Register `processor` on its input queue.
    ///
    /// Fails if a processor is already registered for the same queue.
    pub fn processor(&mut self, processor: ProcessorSettings) -> Result<&mut Self, ConsumerError> {
        if self.settings.processors.contains_key(processor.in_key()) {
            return Err(ConsumerError::DuplicateProcessor(
                processor.in_key().to_owned(),
            ));
        }
        self.settings
            .processors
            .insert(processor.in_key().to_owned(), Arc::new(processor));
        Ok(self)
    }

    /// Register the codec for `mimetype`, replacing any previous one.
    pub fn register_mimetype(
        &mut self,
        mimetype: MimeType,
        encoder: impl Encoder,
        decoder: impl Decoder,
    ) -> &mut Self {
        self.settings.codecs.register(mimetype, encoder, decoder);
        self
    }

    pub fn add_error_handler(&mut self, handler: impl ErrorHandler) -> &mut Self {
        self.settings.error_handlers.push(Arc::new(handler));
        self
    }

    /// Builder flavour of [`Consumer::add_error_handler`].
    #[must_use]
    pub fn on_error(mut self, handler: impl ErrorHandler) -> Self {
        self.add_error_handler(handler);
        self
    }

    pub fn add_startup_task(&mut self, task: impl LifecycleTask) -> &mut Self {
        self.settings.startup_tasks.push(Arc::new(task));
        self
    }

    /// Builder flavour of [`Consumer::add_startup_task`].
    #[must_use]
    pub fn on_startup(mut self, task: impl LifecycleTask) -> Self {
        self.add_startup_task(task);
        self
    }

    pub fn add_shutdown_task(&mut self, task: impl LifecycleTask) -> &mut Self {
        self.settings.shutdown_tasks.push(Arc::new(task));
        self
    }

    /// Builder flavour of [`Consumer::add_shutdown_task`].
    #[must_use]
    pub fn on_shutdown(mut self, task: impl LifecycleTask) -> Self {
        self.add_shutdown_task(task);
        self
    }

    /// The lifecycle of the current run.
    ///
    /// Fails with [`ConsumerError::NotStarted`] if the consumer never ran or was reset.
    pub fn lifecycle(&self) -> Result<Arc<Lifecycle>, ConsumerError> {
        lock(&self.lifecycle).clone().ok_or(ConsumerError::NotStarted)
    }

    /// Run the consumer on the current thread until it shuts down.
    ///
    /// A failed startup does not make `run` fail: the consumer goes through its shutdown
    /// sequence and returns. Check [`Lifecycle::startup_error`] to tell the two apart.
    ///
    /// Ctrl-C or SIGTERM signal a graceful shutdown. A Ctrl-C during the shutdown stops the
    /// consumer straight away.
    ///
    /// Shutdown completes even if the run unwinds, so the consumer can always be
    /// [`reset`](Consumer::reset) afterwards.
    pub fn run(&self) -> Result<(), ConsumerError> {
        let lifecycle = self.create_lifecycle()?;
        let _complete = CompleteOnDrop(lifecycle.as_ref());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ConsumerError::Runtime)?;

        runtime.block_on(async {
            // Installed before the startup, so that a SIGTERM never finds the default handler.
            let sigterm = match ShutdownHandler::sigterm() {
                Ok(handler) => Some(handler),
                Err(e) => {
                    tracing::warn!(error = ?e, "Cannot listen to SIGTERM");
                    None
                }
            };
            let settings = Arc::new(self.settings.clone());
            let shutdown_task = drive(settings, lifecycle.clone());
            tokio::pin!(shutdown_task);
            tokio::select! {
                _ = &mut shutdown_task => {}
                _ = stop_requested(sigterm.as_ref()) => {
                    lifecycle.signal_shutdown();
                    tokio::select! {
                        _ = &mut shutdown_task => {}
                        _ = ctrl_c() => {
                            tracing::warn!(consumer = %lifecycle.name(), "Interrupted again, stopping immediately");
                        }
                    }
                }
            }
        });
        // Whatever is still running is cancelled.
        drop(runtime);

        tracing::info!(consumer = %lifecycle.name(), "Consumer stopped");
        Ok(())
    }

    /// Ask the running consumer to stop once its in-flight messages are processed.
    ///
    /// Safe to call from any thread, while [`Consumer::run`] blocks another one.
    pub fn signal_shutdown(&self) -> Result<(), ConsumerError> {
        self.lifecycle()?.signal_shutdown();
        Ok(())
    }

    /// Discard the lifecycle of the last run, so that the consumer can run again.
    ///
    /// Only legal once the last run is completely shut down.
    pub fn reset(&self) -> Result<(), ConsumerError> {
        let mut slot = lock(&self.lifecycle);
        match slot.as_ref() {
            None => Err(ConsumerError::NotStarted),
            Some(lifecycle) if !lifecycle.shutdown_complete().is_set() => {
                Err(ConsumerError::NotShutDown)
            }
            Some(_) => {
                *slot = None;
                Ok(())
            }
        }
    }

    /// A client that drives this consumer from within a test's own runtime.
    ///
    /// With `delete_queues`, the input and output queues of every processor are deleted (along
    /// with any leftover message) when the client starts.
    pub fn test_client(&self, delete_queues: bool) -> TestClient<'_> {
        TestClient::new(self, delete_queues)
    }

    /// Create the lifecycle of a new run, with a brand new [`Scribe`].
    pub(crate) fn create_lifecycle(&self) -> Result<Arc<Lifecycle>, ConsumerError> {
        let mut slot = lock(&self.lifecycle);
        if slot.is_some() {
            return Err(ConsumerError::LifecycleActive);
        }
        let scribe = Scribe::with_codecs(
            self.settings.connection.clone(),
            self.transport.clone(),
            self.settings.codecs.clone(),
        );
        let lifecycle = Arc::new(Lifecycle::new(self.settings.name.clone(), scribe));
        *slot = Some(lifecycle.clone());
        Ok(lifecycle)
    }
}

/// Sets `shutdown_complete` when dropped.
struct CompleteOnDrop<'a>(&'a Lifecycle);

impl Drop for CompleteOnDrop<'_> {
    fn drop(&mut self) {
        self.0.shutdown_complete().set();
    }
}

/// Start up, then wait for the shutdown sequence to be over.
async fn drive(
    settings: Arc<ConsumerSettings>,
    lifecycle: Arc<Lifecycle>,
) -> Result<(), anyhow::Error> {
    let outcome = start_in_background(settings, lifecycle.clone()).await;
    if let Some(shutdown) = lifecycle.take_shutdown_task() {
        shutdown.await?;
    }
    outcome
}

/// Run the startup sequence and spawn the shutdown task.
///
/// A failed startup signals the shutdown immediately, so that both outcomes go through the
/// same shutdown sequence.
pub(crate) async fn start_in_background(
    settings: Arc<ConsumerSettings>,
    lifecycle: Arc<Lifecycle>,
) -> Result<(), anyhow::Error> {
    lifecycle.startup().set();
    let outcome = start_up(&settings, &lifecycle).await;
    lifecycle.startup_complete().set();

    lifecycle.set_shutdown_task(tokio::spawn(shutdown(settings, lifecycle.clone())));

    if let Err(e) = &outcome {
        tracing::error!(consumer = %lifecycle.name(), error = ?e, "Failed to start up");
        lifecycle.startup_error().set();
        lifecycle.signal_shutdown();
    }
    outcome
}

#[tracing::instrument(name = "consumer_start_up", skip_all, fields(consumer = %lifecycle.name()))]
async fn start_up(settings: &ConsumerSettings, lifecycle: &Arc<Lifecycle>) -> Result<(), anyhow::Error> {
    tracing::info!("Starting up");
    let scribe = lifecycle.scribe();
    scribe.connect().await?;
    scribe.get_channel().await?;
    scribe.set_qos(settings.prefetch_count).await?;

    let error_handlers: ErrorHandlers = settings.error_handlers.clone().into();
    for processor in settings.processors() {
        let stream = scribe
            .consume(processor.in_key(), processor.queue_options())
            .await?;
        tracing::info!(queue = %processor.in_key(), "Consuming");
        lifecycle.push_consume_loop(tokio::spawn(consume_until_shutdown(
            stream,
            processor.clone(),
            lifecycle.clone(),
            error_handlers.clone(),
        )));
    }

    for task in &settings.startup_tasks {
        tracing::info!(task = %task.name(), "Running startup task");
        run_task(task.as_ref(), lifecycle.clone())
            .await
            .map_err(|e| e.context(format!("Startup task '{}' failed", task.name())))?;
    }
    tracing::info!("Running");
    Ok(())
}

/// Wait for the shutdown signal, then tear the run down.
///
/// Consume loops are drained first, so in-flight messages are never interrupted.
/// Shutdown task failures are logged and do not stop the next tasks from running.
#[tracing::instrument(name = "consumer_shutdown", skip_all, fields(consumer = %lifecycle.name()))]
async fn shutdown(settings: Arc<ConsumerSettings>, lifecycle: Arc<Lifecycle>) {
    lifecycle.shutdown_signal().wait().await;
    let _guard = lifecycle.lock_shutdown().lock().await;
    tracing::info!("Shutting down");
    lifecycle.shutdown().set();

    for consume_loop in lifecycle.take_consume_loops() {
        if let Err(e) = consume_loop.await {
            tracing::error!(error = ?e, "A consume loop did not stop cleanly");
        }
    }

    for task in &settings.shutdown_tasks {
        tracing::info!(task = %task.name(), "Running shutdown task");
        if let Err(e) = run_task(task.as_ref(), lifecycle.clone()).await {
            tracing::error!(task = %task.name(), error = ?e, "Shutdown task failed");
        }
    }

    tracing::info!("Closing the connection");
    if let Err(e) = lifecycle.scribe().close_connection().await {
        tracing::warn!(error = ?e, "Failed to close the connection cleanly");
    }
    lifecycle.loop_stopped().set();
}

/// Resolves on Ctrl-C or, when listening to it, on SIGTERM.
async fn stop_requested(sigterm: Option<&Arc<ShutdownHandler>>) {
    let terminated = async {
        match sigterm {
            Some(handler) => handler.wait_for_signal().await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c() => tracing::info!("Interrupted, shutting down"),
        _ = terminated => tracing::info!("Terminated, shutting down"),
    }
}

/// Resolves on Ctrl-C. Never resolves if the signal cannot be listened to.
async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
