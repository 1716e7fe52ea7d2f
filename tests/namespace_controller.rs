use origin_controller::config::ControllerConfig;
use origin_controller::k8s_types::K8sType;
use origin_controller::namespace::{Namespace, ORIGIN_FINALIZER, PHASE_ACTIVE, PHASE_TERMINATING};
use origin_controller::resource::ObjectIdRef;
use origin_controller::runner::api::{
    NamespaceApi, NamespaceListWatch, NamespaceLister, ResourceApi, WatchStream,
};
use origin_controller::runner::client::{Error as ClientError, ListMeta, ObjectList, WatchEvent};
use origin_controller::runner::controller::NamespaceFinalizerController;
use origin_controller::runner::informer::{start_namespace_monitor, ResourceMessage};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tokio::runtime::{self, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn setup() -> Runtime {
    std::env::set_var("RUST_LOG", "origin_controller=debug");
    let _ = env_logger::try_init();
    runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

fn terminating(name: &str) -> Namespace {
    Namespace::new(name)
        .with_phase(PHASE_TERMINATING)
        .with_finalizers(vec!["kubernetes", ORIGIN_FINALIZER])
        .with_resource_version("2")
}

/// In memory stand-in for the api server
#[derive(Default)]
struct FakeCluster {
    namespaces: Vec<Namespace>,
    watch: Mutex<Option<mpsc::Receiver<Result<WatchEvent<Namespace>, ClientError>>>>,
    finalized: Mutex<Vec<Namespace>>,
    lists: Mutex<HashMap<&'static str, usize>>,
    finalize_delay: Option<Duration>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<usize>,
}

impl FakeCluster {
    fn finalized_names(&self) -> Vec<String> {
        self.finalized
            .lock()
            .unwrap()
            .iter()
            .map(|ns| ns.name().to_owned())
            .collect()
    }
}

#[async_trait]
impl NamespaceListWatch for FakeCluster {
    async fn list(&self) -> Result<ObjectList<Namespace>, ClientError> {
        Ok(ObjectList {
            metadata: ListMeta {
                resource_version: Some("1".to_owned()),
            },
            items: self.namespaces.clone(),
        })
    }

    async fn watch(&self, _resource_version: &str) -> Result<WatchStream, ClientError> {
        match self.watch.lock().unwrap().take() {
            Some(rx) => Ok(ReceiverStream::new(rx).boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }
}

/// Lister that reads straight from the fake, for tests that don't need an informer
#[async_trait]
impl NamespaceLister for FakeCluster {
    async fn get(&self, name: &str) -> Result<Option<Namespace>, anyhow::Error> {
        Ok(self
            .namespaces
            .iter()
            .find(|ns| ns.name() == name)
            .cloned())
    }
}

#[async_trait]
impl NamespaceApi for FakeCluster {
    async fn finalize(&self, namespace: &Namespace) -> Result<Namespace, ClientError> {
        let name = namespace.name().to_owned();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(name.clone()).or_insert(0);
            *count += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            *max = (*max).max(*count);
        }
        if let Some(delay) = self.finalize_delay {
            tokio::time::sleep(delay).await;
        }
        self.finalized.lock().unwrap().push(namespace.clone());
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(&name) {
            *count -= 1;
        }
        Ok(namespace.clone())
    }
}

#[async_trait]
impl ResourceApi for FakeCluster {
    async fn list_all(
        &self,
        k8s_type: &'static K8sType,
        _namespace: Option<&str>,
    ) -> Result<Vec<Value>, ClientError> {
        *self
            .lists
            .lock()
            .unwrap()
            .entry(k8s_type.plural_kind)
            .or_insert(0) += 1;
        Ok(Vec::new())
    }

    async fn delete_resource(
        &self,
        _k8s_type: &'static K8sType,
        _id: &ObjectIdRef<'_>,
    ) -> Result<(), ClientError> {
        Ok(())
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wires the informer, dispatcher, and workers together the same way the runner does
fn start(
    cluster: Arc<FakeCluster>,
    config: &ControllerConfig,
) -> (
    NamespaceFinalizerController,
    oneshot::Sender<()>,
    origin_controller::runner::controller::ControllerHandle,
) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let stop = async move {
        let _ = stop_rx.await;
    }
    .shared();

    let (tx, rx) = mpsc::channel::<ResourceMessage>(16);
    let monitor = start_namespace_monitor(ListWatchRef(cluster.clone()), tx, None, stop.clone());
    let controller = NamespaceFinalizerController::new(
        config,
        Arc::new(monitor),
        cluster.clone(),
        cluster,
    );
    let handle = controller.run(rx, stop, config.workers);
    (controller, stop_tx, handle)
}

struct ListWatchRef(Arc<FakeCluster>);

#[async_trait]
impl NamespaceListWatch for ListWatchRef {
    async fn list(&self) -> Result<ObjectList<Namespace>, ClientError> {
        NamespaceListWatch::list(self.0.as_ref()).await
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, ClientError> {
        NamespaceListWatch::watch(self.0.as_ref(), resource_version).await
    }
}

#[test]
fn only_terminating_namespaces_are_finalized() {
    let runtime = setup();
    let cluster = Arc::new(FakeCluster {
        namespaces: vec![
            Namespace::new("active").with_finalizers(vec![ORIGIN_FINALIZER]),
            terminating("doomed"),
        ],
        ..Default::default()
    });

    runtime.block_on(async {
        let (_controller, stop, handle) = start(cluster.clone(), &ControllerConfig::default());

        let c = cluster.clone();
        assert!(wait_for(move || !c.finalized_names().is_empty(), Duration::from_secs(5)).await);
        // give any extra syncs a chance to happen
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _ = stop.send(());
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("controller did not shut down");
    });

    assert_eq!(vec!["doomed".to_owned()], cluster.finalized_names());
    let finalized = cluster.finalized.lock().unwrap();
    assert_eq!(vec!["kubernetes".to_owned()], finalized[0].spec.finalizers);
    assert!(cluster.lists.lock().unwrap().is_empty());
}

#[test]
fn watch_update_to_terminating_triggers_finalization() {
    let runtime = setup();
    let (watch_tx, watch_rx) = mpsc::channel(8);
    let cluster = Arc::new(FakeCluster {
        namespaces: vec![Namespace::new("ns1").with_finalizers(vec![ORIGIN_FINALIZER])],
        watch: Mutex::new(Some(watch_rx)),
        ..Default::default()
    });

    runtime.block_on(async {
        let (_controller, stop, handle) = start(cluster.clone(), &ControllerConfig::default());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cluster.finalized_names().is_empty());

        // a deletion timestamp alone is not enough while the phase is still active
        let deleting = Namespace::new("ns1")
            .with_phase(PHASE_ACTIVE)
            .with_finalizers(vec![ORIGIN_FINALIZER])
            .with_deletion_timestamp("2020-01-01T00:00:00Z")
            .with_resource_version("3");
        watch_tx
            .send(Ok(WatchEvent::Modified(deleting)))
            .await
            .expect("informer stopped watching");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cluster.finalized_names().is_empty());

        let updated = Namespace::new("ns1")
            .with_phase(PHASE_TERMINATING)
            .with_finalizers(vec![ORIGIN_FINALIZER])
            .with_deletion_timestamp("2020-01-01T00:00:00Z")
            .with_resource_version("4");
        watch_tx
            .send(Ok(WatchEvent::Modified(updated)))
            .await
            .expect("informer stopped watching");

        let c = cluster.clone();
        assert!(wait_for(move || !c.finalized_names().is_empty(), Duration::from_secs(5)).await);

        let _ = stop.send(());
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("controller did not shut down");
    });

    assert_eq!(vec!["ns1".to_owned()], cluster.finalized_names());
}

#[test]
fn same_namespace_is_never_finalized_concurrently() {
    let runtime = setup();
    let cluster = Arc::new(FakeCluster {
        namespaces: vec![terminating("ns1")],
        finalize_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let config = ControllerConfig::default().with_workers(4);
    let controller = NamespaceFinalizerController::new(
        &config,
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
    );

    runtime.block_on(async {
        let (_events_tx, events_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = controller.run(
            events_rx,
            async move {
                let _ = stop_rx.await;
            },
            config.workers,
        );

        for _ in 0..10 {
            controller.enqueue("ns1");
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        let c = cluster.clone();
        assert!(wait_for(move || c.finalized_names().len() >= 2, Duration::from_secs(5)).await);

        let _ = stop_tx.send(());
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("controller did not shut down");
    });

    assert_eq!(1, *cluster.max_in_flight.lock().unwrap());
    // keys that were added while being processed coalesce, so there are far fewer syncs than adds
    assert!(cluster.finalized_names().len() < 10);
}

#[test]
fn purge_lists_each_dependent_kind_once() {
    let runtime = setup();
    let cluster = Arc::new(FakeCluster {
        namespaces: vec![terminating("ns1")],
        ..Default::default()
    });
    let config = ControllerConfig::default().purge_dependents(true);
    let controller = NamespaceFinalizerController::new(
        &config,
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
    );

    runtime
        .block_on(controller.sync_namespace("ns1"))
        .expect("sync failed");

    let lists = cluster.lists.lock().unwrap();
    for kind in &[
        "buildconfigs",
        "builds",
        "deploymentconfigs",
        "imagestreams",
        "policies",
        "policybindings",
        "rolebindings",
        "roles",
        "routes",
        "templates",
        "securitycontextconstraints",
    ] {
        assert_eq!(Some(&1), lists.get(kind), "kind: {}", kind);
    }
    assert_eq!(vec!["ns1".to_owned()], cluster.finalized_names());
}

#[test]
fn workers_exit_when_stopped_with_an_empty_queue() {
    let runtime = setup();
    let cluster = Arc::new(FakeCluster::default());

    runtime.block_on(async {
        let (controller, stop, handle) = start(cluster.clone(), &ControllerConfig::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = stop.send(());
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("controller did not shut down");
        assert!(controller.queue().is_shutting_down());
    });
    assert!(cluster.finalized_names().is_empty());
}
