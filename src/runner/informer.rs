//! Keeps an in-memory cache of all namespaces, using an initial list followed by a watch, and
//! sends a message for each change so that the affected namespace can be synced.
use crate::namespace::Namespace;
use crate::runner::api::{NamespaceListWatch, NamespaceLister};
use crate::runner::client::{ApiError, Error as ClientError, ObjectList, WatchEvent};
use crate::runner::metrics::WatcherMetrics;

use anyhow::Error;
use async_trait::async_trait;
use futures::future::{self, Either};
use futures::{pin_mut, StreamExt};
use tokio::sync::mpsc::{error::SendError, Sender};
use tokio::sync::{Mutex, MutexGuard};

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const ERROR_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct NamespaceCache {
    namespaces: HashMap<String, Namespace>,
    error: Option<Error>,
    is_initialized: bool,
}

impl NamespaceCache {
    fn new() -> Self {
        NamespaceCache {
            namespaces: HashMap::new(),
            error: Some(MonitorBackendErr::StateUninitialized.into_boxed_error()),
            is_initialized: false,
        }
    }

    fn clear_all(&mut self) {
        self.namespaces.clear();
        if let Some(err) = self.error.take() {
            log::info!("Clearing previous_error: {}", err);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventType {
    Created,
    Updated,
    Finalizing,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceMessage {
    pub event_type: EventType,
    pub namespace_name: String,
}

/// A locked, consistent view of the cache
pub struct NamespaceState<'a>(MutexGuard<'a, NamespaceCache>);

impl<'a> NamespaceState<'a> {
    pub fn get(&self, name: &str) -> Option<&Namespace> {
        self.0.namespaces.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.namespaces.is_empty()
    }
}

/// The read side of the informer. Reads return an error until the cache has been seeded, and
/// while the informer is recovering from an error.
#[derive(Debug, Clone)]
pub struct NamespaceMonitor {
    cache: Arc<Mutex<NamespaceCache>>,
}

impl NamespaceMonitor {
    pub async fn lock_state(&self) -> Result<NamespaceState<'_>, Error> {
        let mut lock = self.cache.lock().await;
        if let Some(err) = lock.error.take() {
            Err(err)
        } else if !lock.is_initialized {
            Err(MonitorBackendErr::StateUninitialized.into_boxed_error())
        } else {
            Ok(NamespaceState(lock))
        }
    }
}

#[async_trait]
impl NamespaceLister for NamespaceMonitor {
    async fn get(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let state = self.lock_state().await?;
        Ok(state.get(name).cloned())
    }
}

#[derive(Debug)]
enum MonitorBackendErr {
    SendErr,
    ClientErr(ClientError),
    ResourceVersionExpired,
    MissingResourceVersion,
    Api(ApiError),
    StateUninitialized,
}

impl Display for MonitorBackendErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MonitorBackendErr::SendErr => f.write_str("Sender channel closed"),
            MonitorBackendErr::StateUninitialized => f.write_str("Namespace cache has not been initialized or may be temporarily recovering from an error"),
            MonitorBackendErr::ClientErr(err) => write!(f, "Client Error: {}", err),
            MonitorBackendErr::ResourceVersionExpired => f.write_str("Resource Version has expired, watcher is out of sync"),
            MonitorBackendErr::MissingResourceVersion => f.write_str("list result from api server is missing metadata.resourceVersion"),
            MonitorBackendErr::Api(e) => write!(f, "Watcher received api error: {}", e),
        }
    }
}

impl std::error::Error for MonitorBackendErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorBackendErr::ClientErr(err) => Some(err),
            MonitorBackendErr::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl MonitorBackendErr {
    fn into_boxed_error(self) -> Error {
        Error::new(self)
    }

    fn is_resource_version_expired(&self) -> bool {
        match self {
            MonitorBackendErr::ResourceVersionExpired => true,
            _ => false,
        }
    }

    fn is_send_err(&self) -> bool {
        match self {
            MonitorBackendErr::SendErr => true,
            _ => false,
        }
    }
}

impl From<ApiError> for MonitorBackendErr {
    fn from(err: ApiError) -> MonitorBackendErr {
        if err.code == 410 {
            MonitorBackendErr::ResourceVersionExpired
        } else {
            MonitorBackendErr::Api(err)
        }
    }
}

impl From<ClientError> for MonitorBackendErr {
    fn from(err: ClientError) -> MonitorBackendErr {
        if err.is_http_410() {
            MonitorBackendErr::ResourceVersionExpired
        } else {
            MonitorBackendErr::ClientErr(err)
        }
    }
}

impl<T> From<SendError<T>> for MonitorBackendErr {
    fn from(_: SendError<T>) -> MonitorBackendErr {
        MonitorBackendErr::SendErr
    }
}

/// Spawns the informer onto the current runtime and returns the monitor for reading from its cache.
/// The informer runs until `stop` resolves or `sender` is closed.
pub fn start_namespace_monitor<S, F>(
    source: S,
    sender: Sender<ResourceMessage>,
    watcher_metrics: Option<WatcherMetrics>,
    stop: F,
) -> NamespaceMonitor
where
    S: NamespaceListWatch,
    F: Future<Output = ()> + Send + 'static,
{
    let cache = Arc::new(Mutex::new(NamespaceCache::new()));
    let frontend = NamespaceMonitor {
        cache: cache.clone(),
    };

    let backend = NamespaceMonitorBackend {
        metrics: watcher_metrics,
        cache,
        source,
        sender,
        error_retry_delay: ERROR_RETRY_DELAY,
    };
    tokio::spawn(async move {
        let run = backend.run();
        pin_mut!(run, stop);
        if let Either::Right(_) = future::select(run, stop).await {
            log::info!("Stopped monitor for namespaces");
        }
    });
    frontend
}

struct NamespaceMonitorBackend<S: NamespaceListWatch> {
    metrics: Option<WatcherMetrics>,
    cache: Arc<Mutex<NamespaceCache>>,
    source: S,
    sender: Sender<ResourceMessage>,
    error_retry_delay: Duration,
}

impl<S: NamespaceListWatch> NamespaceMonitorBackend<S> {
    async fn run(mut self) {
        log::debug!("Starting monitoring namespaces");

        loop {
            let result = match self.seed_cache().await {
                Ok(resource_version) => self.run_inner(resource_version).await,
                Err(err) => {
                    log::error!("Error seeding namespace cache: {:?}", err);
                    Err(err)
                }
            };
            if let Err(err) = result {
                if !self.handle_error(err).await {
                    break;
                }
            }
        }
        log::info!("Ending monitor for namespaces");
    }

    async fn handle_error(&mut self, error: MonitorBackendErr) -> bool {
        let is_http_410 = error.is_resource_version_expired();
        let is_send_err = error.is_send_err();
        log::error!("Error in namespace monitor, err: {:?}", error);
        {
            let mut lock = self.cache.lock().await;
            lock.error = Some(error.into_boxed_error());
            lock.is_initialized = false;
        }

        if is_send_err {
            // nobody is listening anymore
            return false;
        }
        if !is_http_410 {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.error();
            }
            tokio::time::sleep(self.error_retry_delay).await;
        }
        true
    }

    async fn run_inner(&mut self, mut resource_version: String) -> Result<(), MonitorBackendErr> {
        loop {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.request_started();
            }
            match self.do_watch(&resource_version).await {
                Ok(Some(vers)) => {
                    resource_version = vers;
                }
                Ok(None) => {}
                Err(MonitorBackendErr::ResourceVersionExpired) => {
                    log::warn!("ResourceVersion {} is too old for namespaces", resource_version);
                    return Err(MonitorBackendErr::ResourceVersionExpired);
                }
                Err(err) => {
                    return Err(err);
                }
            }
        }
    }

    async fn do_watch(
        &mut self,
        resource_version: &str,
    ) -> Result<Option<String>, MonitorBackendErr> {
        log::debug!(
            "Starting watch of namespaces with resourceVersion: {:?}",
            resource_version
        );

        let mut events = self.source.watch(resource_version).await?;
        let mut new_version: Option<String> = None;
        while let Some(result) = events.next().await {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.event_received();
            }
            let event = result?;
            if let Some(event_version) = self.handle_event(event).await? {
                new_version = Some(event_version);
            }
        }
        Ok(new_version)
    }

    async fn handle_event(
        &mut self,
        event: WatchEvent<Namespace>,
    ) -> Result<Option<String>, MonitorBackendErr> {
        let (event_type, namespace) = match event {
            WatchEvent::Added(ns) => (EventType::Created, ns),
            WatchEvent::Deleted(ns) => (EventType::Deleted, ns),
            WatchEvent::Modified(ns) => (get_update_event_type(&ns), ns),
            WatchEvent::Error(err) => {
                log::warn!("Got apiError for watch on namespaces, err: {:?}", err);
                return Err(err.into());
            }
        };
        let resource_version = namespace.metadata.resource_version.clone();
        let namespace_name = namespace.name().to_owned();

        let mut cache = self.cache.lock().await;
        match event_type {
            EventType::Deleted => {
                cache.namespaces.remove(&namespace_name);
            }
            _ => {
                cache.namespaces.insert(namespace_name.clone(), namespace);
            }
        }
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.set_resource_count(cache.namespaces.len());
        }
        drop(cache);

        let to_send = ResourceMessage {
            event_type,
            namespace_name,
        };
        self.sender.send(to_send).await?;
        Ok(resource_version)
    }

    async fn seed_cache(&mut self) -> Result<String, MonitorBackendErr> {
        log::info!("Seeding namespace cache");
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.request_started();
        }
        let ObjectList { metadata, items } = self.source.list().await?;
        let resource_version = metadata
            .resource_version
            .ok_or(MonitorBackendErr::MissingResourceVersion)?;

        let mut messages = Vec::with_capacity(items.len());
        let mut namespaces = HashMap::with_capacity(items.len());
        for namespace in items {
            let namespace_name = namespace.name().to_owned();
            messages.push(ResourceMessage {
                event_type: get_update_event_type(&namespace),
                namespace_name: namespace_name.clone(),
            });
            namespaces.insert(namespace_name, namespace);
        }

        // swap in the whole list at once, so that consumers never see a partially seeded cache
        let mut cache = self.cache.lock().await;
        cache.clear_all();
        cache.namespaces = namespaces;
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.set_resource_count(cache.namespaces.len());
        }
        cache.is_initialized = true;
        drop(cache);

        // sending happens after the lock is released, since the receiver may need to read from the
        // cache before it has room for more messages
        log::debug!("Seeded cache with {} namespaces", messages.len());
        for message in messages {
            self.sender.send(message).await?;
        }
        Ok(resource_version)
    }
}

fn get_update_event_type(namespace: &Namespace) -> EventType {
    if namespace.is_terminating() || namespace.is_marked_for_deletion() {
        EventType::Finalizing
    } else {
        EventType::Updated
    }
}
