//! The namespace finalizer controller. It removes the origin finalizer token from namespaces that
//! are terminating, after optionally purging the platform resources they contain, so that the
//! namespace deletion can proceed.
use crate::config::{ControllerConfig, RateLimitConfig};
use crate::namespace::Namespace;
use crate::runner::api::{NamespaceApi, NamespaceLister, ResourceApi};
use crate::runner::client::Error as ClientError;
use crate::runner::informer::{EventType, ResourceMessage};
use crate::runner::metrics::{Metrics, SyncMetrics};
use crate::runner::purge::{purge_dependents, PurgeError};
use crate::runner::workqueue::{default_controller_rate_limiter, WorkQueue};

use futures::FutureExt;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

use std::any::Any;
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

const QUEUE_NAME: &str = "namespaces";

#[derive(Debug)]
pub enum SyncError {
    Lister(anyhow::Error),
    Client(ClientError),
    Purge(PurgeError),
    Panic(String),
}

impl Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::Lister(e) => write!(f, "failed to get namespace from cache: {}", e),
            SyncError::Client(e) => write!(f, "failed to finalize namespace: {}", e),
            SyncError::Purge(e) => write!(f, "failed to purge namespace: {}", e),
            SyncError::Panic(msg) => write!(f, "sync panicked: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Lister(e) => Some(&**e),
            SyncError::Client(e) => Some(e),
            SyncError::Purge(e) => Some(e),
            SyncError::Panic(_) => None,
        }
    }
}

impl From<ClientError> for SyncError {
    fn from(err: ClientError) -> SyncError {
        SyncError::Client(err)
    }
}

impl From<PurgeError> for SyncError {
    fn from(err: PurgeError) -> SyncError {
        SyncError::Purge(err)
    }
}

/// Returned from `NamespaceFinalizerController::run`. The controller keeps running until the
/// stop future passed to `run` resolves.
#[derive(Debug)]
pub struct ControllerHandle {
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Waits for all of the workers to finish their in-flight syncs and exit
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(err) = worker.await {
                log::error!("Worker task failed: {}", err);
            }
        }
        for task in self.background {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct NamespaceFinalizerController {
    finalizer_name: Arc<str>,
    purge_dependents: bool,
    max_retries: Option<u32>,
    rate_limits: RateLimitConfig,
    lister: Arc<dyn NamespaceLister>,
    namespaces: Arc<dyn NamespaceApi>,
    resources: Arc<dyn ResourceApi>,
    queue: WorkQueue<String>,
    metrics: Option<SyncMetrics>,
}

impl fmt::Debug for NamespaceFinalizerController {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NamespaceFinalizerController")
            .field("finalizer_name", &self.finalizer_name)
            .field("purge_dependents", &self.purge_dependents)
            .field("max_retries", &self.max_retries)
            .field("queue_len", &self.queue.len())
            .finish()
    }
}

impl NamespaceFinalizerController {
    pub fn new(
        config: &ControllerConfig,
        lister: Arc<dyn NamespaceLister>,
        namespaces: Arc<dyn NamespaceApi>,
        resources: Arc<dyn ResourceApi>,
    ) -> NamespaceFinalizerController {
        let queue = WorkQueue::new(default_controller_rate_limiter(&config.rate_limits));
        NamespaceFinalizerController {
            finalizer_name: Arc::from(config.finalizer_name.as_str()),
            purge_dependents: config.purge_dependents,
            max_retries: config.max_retries,
            rate_limits: config.rate_limits.clone(),
            lister,
            namespaces,
            resources,
            queue,
            metrics: None,
        }
    }

    /// Records sync and queue metrics. Must be called before any keys are enqueued, since the
    /// queue gets replaced.
    pub fn with_metrics(mut self, metrics: &Metrics) -> NamespaceFinalizerController {
        self.queue = WorkQueue::with_metrics(
            default_controller_rate_limiter(&self.rate_limits),
            metrics.queue_metrics(QUEUE_NAME),
        );
        self.metrics = Some(metrics.sync_metrics());
        self
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    pub fn enqueue(&self, namespace_name: impl Into<String>) {
        self.queue.add(namespace_name.into());
    }

    /// Spawns the event dispatcher and `workers` worker tasks, and returns immediately. Once
    /// `stop` resolves, the queue is shut down and the workers exit after their current sync.
    pub fn run<F>(&self, events: Receiver<ResourceMessage>, stop: F, workers: usize) -> ControllerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let dispatcher = self.dispatch_events(events);

        let queue = self.queue.clone();
        let stopper = tokio::spawn(async move {
            stop.await;
            log::info!("Shutting down namespace finalizer controller");
            queue.shut_down();
        });

        let workers = (0..workers.max(1))
            .map(|id| {
                let controller = self.clone();
                tokio::spawn(async move { controller.run_worker(id).await })
            })
            .collect();

        ControllerHandle {
            workers,
            background: vec![dispatcher, stopper],
        }
    }

    /// Adds a key to the queue for every namespace event, except deletions
    pub fn dispatch_events(&self, mut events: Receiver<ResourceMessage>) -> JoinHandle<()> {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                match message.event_type {
                    EventType::Created | EventType::Updated | EventType::Finalizing => {
                        queue.add(message.namespace_name);
                    }
                    EventType::Deleted => {
                        log::trace!("Ignoring deletion of namespace '{}'", message.namespace_name);
                    }
                }
            }
            log::debug!("Namespace event channel closed, dispatcher exiting");
        })
    }

    async fn run_worker(self, id: usize) {
        log::debug!("Starting worker: {}", id);
        while self.process_next_work_item().await {}
        log::debug!("Worker: {} exiting", id);
    }

    /// Processes a single key from the queue. Returns false once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let key = match self.queue.get().await {
            Some(key) => key,
            None => return false,
        };

        let result = AssertUnwindSafe(self.sync_namespace(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(SyncError::Panic(panic_message(panic))));

        match result {
            Ok(()) => self.queue.forget(&key),
            Err(err) => {
                self.handle_error(&key, &err);
                match self.max_retries {
                    Some(max) if self.queue.num_requeues(&key) >= max => {
                        log::error!(
                            "Dropping namespace '{}' from the queue after {} retries",
                            key,
                            max
                        );
                        self.queue.forget(&key);
                    }
                    _ => self.queue.add_rate_limited(key.clone()),
                }
            }
        }
        self.queue.done(&key);
        true
    }

    pub fn handle_error(&self, key: &str, err: &SyncError) {
        log::error!("Error syncing namespace '{}': {}", key, err);
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.sync_error();
        }
    }

    /// Removes the finalizer from the namespace if it's terminating. Namespaces that no longer
    /// exist, that are still active, or that don't have the finalizer are left alone.
    pub async fn sync_namespace(&self, name: &str) -> Result<(), SyncError> {
        let _timer = self.metrics.as_ref().map(SyncMetrics::sync_started);

        let namespace = match self.lister.get(name).await.map_err(SyncError::Lister)? {
            Some(ns) => ns,
            None => {
                log::debug!("Namespace '{}' no longer exists", name);
                return Ok(());
            }
        };
        if !namespace.has_finalizer(&self.finalizer_name) {
            log::trace!("Namespace '{}' does not have finalizer '{}'", name, self.finalizer_name);
            return Ok(());
        }
        if !namespace.is_terminating() {
            log::trace!("Namespace '{}' is not terminating", name);
            return Ok(());
        }
        self.finalize(namespace).await
    }

    /// Purges the namespace if configured to, then removes the finalizer using the `finalize`
    /// subresource
    pub async fn finalize(&self, mut namespace: Namespace) -> Result<(), SyncError> {
        if self.purge_dependents {
            purge_dependents(self.resources.as_ref(), namespace.name()).await?;
        }

        namespace.remove_finalizer(&self.finalizer_name);
        let updated = self.namespaces.finalize(&namespace).await?;
        log::info!(
            "Removed finalizer '{}' from namespace '{}', remaining finalizers: {:?}",
            self.finalizer_name,
            updated.name(),
            updated.spec.finalizers
        );
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.namespace_finalized();
        }
        Ok(())
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
