use crate::k8s_types::K8sType;

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, HistogramTimer, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use std::fmt::{self, Debug};

const API_VERSION_AND_KIND: &[&str] = &["apiVersion", "kind"];
const METHOD: &[&str] = &["method"];
const QUEUE_NAME: &[&str] = &["name"];

/// All of the prometheus metrics for a running controller. Each component gets its own handle to
/// just the metrics it updates, and the registry is only used for rendering them.
pub struct Metrics {
    registry: Registry,
    api_server_request_times: HistogramVec,
    api_server_request_errors: IntCounterVec,
    resources_by_type: IntGaugeVec,
    watcher_requests_by_type: IntCounterVec,
    watcher_errors_by_type: IntCounterVec,
    watch_events_by_type: IntCounterVec,
    queue_depth: IntGaugeVec,
    queue_adds: IntCounterVec,
    queue_retries: IntCounterVec,
    namespace_syncs: IntCounter,
    namespace_sync_errors: IntCounter,
    namespaces_finalized: IntCounter,
    namespace_sync_times: Histogram,
    apply_items_created: IntCounter,
    apply_items_failed: IntCounter,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

fn register<T>(registry: &Registry, metric: T) -> Result<T, prometheus::Error>
where
    T: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        // 5ms, 10ms, 20ms ... ~10s
        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending the request to receiving the response headers",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12)?);
        let api_server_request_times =
            register(&registry, HistogramVec::new(request_time_opts, METHOD)?)?;

        let request_error_opts = Opts::new(
            "api_server_request_errors",
            "number of requests that failed without receiving a response",
        )
        .subsystem("client");
        let api_server_request_errors =
            register(&registry, IntCounterVec::new(request_error_opts, METHOD)?)?;

        let resource_count_opts = Opts::new(
            "cached_resources",
            "number of resources in the in-memory cache",
        );
        let resources_by_type = register(
            &registry,
            IntGaugeVec::new(resource_count_opts, API_VERSION_AND_KIND)?,
        )?;

        let watcher_request_opts =
            Opts::new("watcher_requests", "number of requests from watchers");
        let watcher_requests_by_type = register(
            &registry,
            IntCounterVec::new(watcher_request_opts, API_VERSION_AND_KIND)?,
        )?;

        let watcher_error_opts = Opts::new("watcher_errors", "number of errors from watchers");
        let watcher_errors_by_type = register(
            &registry,
            IntCounterVec::new(watcher_error_opts, API_VERSION_AND_KIND)?,
        )?;

        let watcher_event_opts = Opts::new(
            "watch_events",
            "number of watch events received by watchers",
        );
        let watch_events_by_type = register(
            &registry,
            IntCounterVec::new(watcher_event_opts, API_VERSION_AND_KIND)?,
        )?;

        let queue_depth = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("depth", "current number of keys waiting in the queue").subsystem("workqueue"),
                QUEUE_NAME,
            )?,
        )?;
        let queue_adds = register(
            &registry,
            IntCounterVec::new(
                Opts::new("adds", "total number of keys added to the queue").subsystem("workqueue"),
                QUEUE_NAME,
            )?,
        )?;
        let queue_retries = register(
            &registry,
            IntCounterVec::new(
                Opts::new("retries", "total number of rate limited requeues").subsystem("workqueue"),
                QUEUE_NAME,
            )?,
        )?;

        let namespace_syncs = register(
            &registry,
            IntCounter::with_opts(Opts::new("namespace_syncs", "number of namespace syncs started"))?,
        )?;
        let namespace_sync_errors = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "namespace_sync_errors",
                "number of namespace syncs that returned an error",
            ))?,
        )?;
        let namespaces_finalized = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "namespaces_finalized",
                "number of namespaces that had the origin finalizer removed",
            ))?,
        )?;
        let namespace_sync_times = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new("namespace_sync_time", "time taken to sync a single namespace")
                    .buckets(exponential_buckets(0.005, 2.0, 14)?),
            )?,
        )?;

        let apply_items_created = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "items_created",
                "number of config items that were created successfully",
            )
            .subsystem("apply"))?,
        )?;
        let apply_items_failed = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "items_failed",
                "number of config items that failed validation or creation",
            )
            .subsystem("apply"))?,
        )?;

        Ok(Metrics {
            registry,
            api_server_request_times,
            api_server_request_errors,
            resources_by_type,
            watcher_requests_by_type,
            watcher_errors_by_type,
            watch_events_by_type,
            queue_depth,
            queue_adds,
            queue_retries,
            namespace_syncs,
            namespace_sync_errors,
            namespaces_finalized,
            namespace_sync_times,
            apply_items_created,
            apply_items_failed,
        })
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            api_server_request_times: self.api_server_request_times.clone(),
            api_server_request_errors: self.api_server_request_errors.clone(),
        }
    }

    pub fn watcher_metrics(&self, k8s_type: &K8sType) -> WatcherMetrics {
        let labels = &[k8s_type.api_version, k8s_type.kind];
        WatcherMetrics {
            watcher_requests: self.watcher_requests_by_type.with_label_values(labels),
            watcher_errors: self.watcher_errors_by_type.with_label_values(labels),
            watch_events: self.watch_events_by_type.with_label_values(labels),
            resource_count: self.resources_by_type.with_label_values(labels),
        }
    }

    pub fn queue_metrics(&self, queue_name: &str) -> QueueMetrics {
        let labels = &[queue_name];
        QueueMetrics {
            depth: self.queue_depth.with_label_values(labels),
            adds: self.queue_adds.with_label_values(labels),
            retries: self.queue_retries.with_label_values(labels),
        }
    }

    pub fn sync_metrics(&self) -> SyncMetrics {
        SyncMetrics {
            syncs: self.namespace_syncs.clone(),
            errors: self.namespace_sync_errors.clone(),
            finalized: self.namespaces_finalized.clone(),
            sync_times: self.namespace_sync_times.clone(),
        }
    }

    pub fn apply_metrics(&self) -> ApplyMetrics {
        ApplyMetrics {
            created: self.apply_items_created.clone(),
            failed: self.apply_items_failed.clone(),
        }
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

#[derive(Clone)]
pub struct ClientMetrics {
    api_server_request_times: HistogramVec,
    api_server_request_errors: IntCounterVec,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self, method: &str) -> HistogramTimer {
        self.api_server_request_times
            .with_label_values(&[method])
            .start_timer()
    }

    pub fn request_failed(&self, method: &str) {
        self.api_server_request_errors
            .with_label_values(&[method])
            .inc();
    }
}

pub struct WatcherMetrics {
    watcher_requests: IntCounter,
    watcher_errors: IntCounter,
    watch_events: IntCounter,
    resource_count: IntGauge,
}

impl Debug for WatcherMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WatcherMetrics")
    }
}

impl WatcherMetrics {
    pub fn set_resource_count(&self, count: usize) {
        self.resource_count.set(count as i64);
    }

    pub fn request_started(&self) {
        self.watcher_requests.inc();
    }

    pub fn event_received(&self) {
        self.watch_events.inc();
    }

    pub fn error(&self) {
        self.watcher_errors.inc();
    }
}

#[derive(Clone)]
pub struct QueueMetrics {
    depth: IntGauge,
    adds: IntCounter,
    retries: IntCounter,
}

impl Debug for QueueMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("QueueMetrics")
    }
}

impl QueueMetrics {
    pub fn added(&self, depth: usize) {
        self.adds.inc();
        self.depth.set(depth as i64);
    }

    pub fn depth(&self, depth: usize) {
        self.depth.set(depth as i64);
    }

    pub fn retry(&self) {
        self.retries.inc();
    }
}

#[derive(Clone)]
pub struct SyncMetrics {
    syncs: IntCounter,
    errors: IntCounter,
    finalized: IntCounter,
    sync_times: Histogram,
}

impl Debug for SyncMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SyncMetrics")
    }
}

impl SyncMetrics {
    pub fn sync_started(&self) -> HistogramTimer {
        self.syncs.inc();
        self.sync_times.start_timer()
    }

    pub fn sync_error(&self) {
        self.errors.inc();
    }

    pub fn namespace_finalized(&self) {
        self.finalized.inc();
    }
}

#[derive(Clone)]
pub struct ApplyMetrics {
    created: IntCounter,
    failed: IntCounter,
}

impl Debug for ApplyMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ApplyMetrics")
    }
}

impl ApplyMetrics {
    pub fn item_created(&self) {
        self.created.inc();
    }

    pub fn item_failed(&self) {
        self.failed.inc();
    }
}
