//! Runs the namespace finalizer controller against whatever cluster the service account or
//! kubeconfig points to. Set `PURGE_DEPENDENTS=true` to also delete builds, routes, etc from
//! terminating namespaces before they're finalized.
use origin_controller::prelude::*;

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "origin_controller=info");
    }
    env_logger::init();

    let purge = std::env::var("PURGE_DEPENDENTS")
        .map(|value| value == "true")
        .unwrap_or(false);
    let config = ControllerConfig::default()
        .with_workers(5)
        .purge_dependents(purge);

    let err = run_controller(config);
    log::error!("Controller exited with error: {}", err);
    std::process::exit(1);
}
