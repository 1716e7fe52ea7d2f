pub mod api;
pub mod client;
pub mod controller;
pub mod informer;
pub mod metrics;
pub mod purge;
mod server;
pub mod workqueue;

use crate::config::{ClientConfig, ControllerConfig};
use crate::error::Error;
use crate::k8s_types;
use crate::runner::client::Client;
use crate::runner::controller::NamespaceFinalizerController;
use crate::runner::informer::ResourceMessage;
use crate::runner::metrics::Metrics;

use futures::future::{self, FutureExt};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use std::fmt::{self, Display};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A handle to a potentially running controller, which allows for shutting it down. The
/// controller is also shut down when the handle is dropped.
pub struct ShutdownHandle {
    stop: Option<oneshot::Sender<()>>,
    running: Arc<AtomicBool>,
}

impl std::ops::Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl ShutdownHandle {
    pub fn shutdown_now(self) {}

    /// Returns false once the controller has finished shutting down
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct UnexpectedShutdownError;
impl Display for UnexpectedShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Controller shutdown due to an unexpected error")
    }
}
impl std::error::Error for UnexpectedShutdownError {}

fn metrics_error(err: prometheus::Error) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("failed to register metrics: {}", err),
    )
}

/// Starts the controller and blocks the current thread indefinitely until the controller shuts
/// down due to an error. The client configuration is loaded from the service account if
/// possible, otherwise from the kubeconfig file.
pub fn run_controller(config: ControllerConfig) -> Error {
    let client_config = {
        let user_agent = config.controller_name.as_str();
        let result = ClientConfig::from_service_account(user_agent).or_else(|_| {
            log::debug!("Failed to load ClientConfig from service account, so trying to load from kubeconfig");
            ClientConfig::from_kubeconfig(user_agent)
        });
        match result {
            Ok(conf) => conf,
            Err(err) => return err.into(),
        }
    };
    run_controller_with_client_config(config, client_config)
}

/// Starts the controller and blocks the current thread indefinitely until the controller shuts
/// down due to an error.
pub fn run_controller_with_client_config(
    config: ControllerConfig,
    client_config: ClientConfig,
) -> Error {
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => return metrics_error(err).into(),
    };
    let client = match Client::new(client_config, metrics.client_metrics()) {
        Ok(c) => c,
        Err(err) => return err.into(),
    };
    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(err) => return err.into(),
    };
    let running = Arc::new(AtomicBool::new(true));
    runtime.block_on(run_with_client(
        metrics,
        running,
        config,
        client,
        future::pending::<()>(),
    ));
    log::warn!("Controller stopped, shutting down runtime");
    // return an error here, since the controller will never exit under normal circumstances
    Box::new(UnexpectedShutdownError)
}

/// Starts the controller asynchronously using the provided runtime. This function will return
/// immediately with a handle that can be used to shutdown the controller at a later point. Will
/// return an error if it fails to create the http client due to invalid configuration.
pub fn start_controller_with_runtime(
    runtime: &Runtime,
    config: ControllerConfig,
    client_config: ClientConfig,
) -> Result<ShutdownHandle, Error> {
    let metrics = Metrics::new().map_err(metrics_error)?;
    let client = Client::new(client_config, metrics.client_metrics())?;
    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = ShutdownHandle {
        stop: Some(stop_tx),
        running: running.clone(),
    };
    runtime.spawn(run_with_client(
        metrics,
        running,
        config,
        client,
        stop_rx.map(|_| ()),
    ));
    Ok(handle)
}

async fn run_with_client<F>(
    metrics: Metrics,
    running: Arc<AtomicBool>,
    config: ControllerConfig,
    client: Client,
    stop: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    log::debug!("Starting controller with configuration: {:?}", config);
    let metrics = Arc::new(metrics);
    let stop = stop.shared();

    let (tx, rx) = tokio::sync::mpsc::channel::<ResourceMessage>(EVENT_CHANNEL_CAPACITY);
    let watcher_metrics = metrics.watcher_metrics(k8s_types::core::v1::Namespace);
    let monitor = informer::start_namespace_monitor(
        client.clone(),
        tx,
        Some(watcher_metrics),
        stop.clone(),
    );

    let api = Arc::new(client);
    let controller =
        NamespaceFinalizerController::new(&config, Arc::new(monitor), api.clone(), api)
            .with_metrics(&metrics);
    let handle = controller.run(rx, stop.clone(), config.workers);

    if config.expose_metrics || config.expose_health {
        let server_future = server::start(
            config.server_port,
            metrics.clone(),
            config.expose_metrics,
            config.expose_health,
            stop,
        );
        let (server_result, ()) = future::join(server_future, handle.join()).await;
        if let Err(err) = server_result {
            log::error!("Server failed with error: {}", err);
        }
    } else {
        handle.join().await;
    }
    running.store(false, Ordering::Relaxed);
    log::info!("Namespace finalizer controller stopped");
}
