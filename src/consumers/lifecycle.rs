//! The state of a single run of a [`Consumer`](super::Consumer).
use crate::scribe::Scribe;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A flag that, once set, stays set.
///
/// It can be set from any thread and awaited from any task.
#[derive(Clone)]
pub struct Event {
    sender: Arc<watch::Sender<bool>>,
}

impl Event {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn set(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once the event is set.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            // The sender lives as long as `self`: this cannot fail while we wait.
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Event").field(&self.is_set()).finish()
    }
}

/// Everything that exists for exactly one run of a consumer: its [`Scribe`], the events
/// marking the progress of the run and the background tasks driving it.
///
/// The events are set in this order:
/// `startup` → `startup_complete` (with `startup_error` if it failed) → `shutdown_signal`
/// → `shutdown` → `loop_stopped` → `shutdown_complete`.
pub struct Lifecycle {
    name: String,
    scribe: Arc<Scribe>,
    startup: Event,
    startup_complete: Event,
    startup_error: Event,
    shutdown_signal: Event,
    shutdown: Event,
    loop_stopped: Event,
    shutdown_complete: Event,
    lock_shutdown: tokio::sync::Mutex<()>,
    active_workers: AtomicUsize,
    consume_loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Lifecycle {
    pub(crate) fn new(name: String, scribe: Scribe) -> Self {
        Self {
            name,
            scribe: Arc::new(scribe),
            startup: Event::new(),
            startup_complete: Event::new(),
            startup_error: Event::new(),
            shutdown_signal: Event::new(),
            shutdown: Event::new(),
            loop_stopped: Event::new(),
            shutdown_complete: Event::new(),
            lock_shutdown: tokio::sync::Mutex::new(()),
            active_workers: AtomicUsize::new(0),
            consume_loops: Mutex::new(Vec::new()),
            shutdown_task: Mutex::new(None),
        }
    }

    /// The name of the consumer this lifecycle belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scribe(&self) -> &Arc<Scribe> {
        &self.scribe
    }

    /// Set when the run begins.
    pub fn startup(&self) -> &Event {
        &self.startup
    }

    /// Set when the startup sequence is over, whether it succeeded or not.
    pub fn startup_complete(&self) -> &Event {
        &self.startup_complete
    }

    /// Set if the startup sequence failed.
    pub fn startup_error(&self) -> &Event {
        &self.startup_error
    }

    /// Set when a shutdown is requested.
    pub fn shutdown_signal(&self) -> &Event {
        &self.shutdown_signal
    }

    /// Set when the shutdown sequence starts.
    pub fn shutdown(&self) -> &Event {
        &self.shutdown
    }

    /// Set when the shutdown sequence is over and the connection closed.
    pub fn loop_stopped(&self) -> &Event {
        &self.loop_stopped
    }

    /// Set once the run is completely over. The consumer can only be reset after this.
    pub fn shutdown_complete(&self) -> &Event {
        &self.shutdown_complete
    }

    /// Ask the consumer to stop. Messages being processed are allowed to finish.
    ///
    /// Safe to call from any thread.
    pub fn signal_shutdown(&self) {
        tracing::info!(consumer = %self.name, "Signaling shutdown");
        self.shutdown_signal.set();
    }

    /// How many messages are being processed right now.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Serializes the final cleanup of a run.
    pub(crate) fn lock_shutdown(&self) -> &tokio::sync::Mutex<()> {
        &self.lock_shutdown
    }

    pub(crate) fn enter_worker(&self) -> WorkerGuard<'_> {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        WorkerGuard {
            active_workers: &self.active_workers,
        }
    }

    pub(crate) fn push_consume_loop(&self, handle: JoinHandle<()>) {
        lock(&self.consume_loops).push(handle);
    }

    pub(crate) fn take_consume_loops(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *lock(&self.consume_loops))
    }

    pub(crate) fn set_shutdown_task(&self, handle: JoinHandle<()>) {
        *lock(&self.shutdown_task) = Some(handle);
    }

    pub(crate) fn take_shutdown_task(&self) -> Option<JoinHandle<()>> {
        lock(&self.shutdown_task).take()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("startup_complete", &self.startup_complete)
            .field("startup_error", &self.startup_error)
            .field("shutdown_signal", &self.shutdown_signal)
            .field("shutdown_complete", &self.shutdown_complete)
            .field("active_workers", &self.active_workers())
            .finish()
    }
}

/// Counts a message as in flight until dropped.
pub(crate) struct WorkerGuard<'a> {
    active_workers: &'a AtomicUsize,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}
