//! Origin Controller removes the `openshift.io/origin` finalizer from namespaces once they start
//! terminating, so that deleting a project isn't blocked forever. It can optionally purge the
//! platform resources (builds, deployment configs, routes, policies, etc) from the namespace
//! first. It also provides the Config applier, which creates every object from a `Config`
//! document and reports the outcome of each one.
//!
//! Running the controller:
//! ```no_run
//! use origin_controller::prelude::*;
//!
//! let config = ControllerConfig::new("origin-namespace-controller")
//!     .with_workers(5)
//!     .purge_dependents(true);
//!
//! // this function will block the current thread indefinitely while the controller runs
//! let err = run_controller(config);
//! eprintln!("controller exited with error: {}", err);
//! ```
//!
//! Applying a Config document:
//! ```no_run
//! use origin_controller::prelude::*;
//! use origin_controller::apply::{Applier, ClientMappings, RestMapper, known_types};
//! use origin_controller::runner::client::Client;
//! use origin_controller::runner::metrics::Metrics;
//!
//! # async fn apply_example(document: &[u8]) -> Result<(), Error> {
//! let metrics = Metrics::new().expect("failed to create metrics");
//! let client_config = ClientConfig::from_kubeconfig("origin-apply")?;
//! let client = Client::new(client_config, metrics.client_metrics())?;
//! let mappings = ClientMappings::for_client(&client, &known_types());
//! let applier = Applier::new(RestMapper::default(), mappings);
//!
//! for result in applier.apply("my-project", document).await? {
//!     println!("{}", result.message);
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate serde_derive;

pub mod apply;
pub mod config;
pub mod error;
pub mod k8s_types;
pub mod namespace;
pub mod resource;
pub mod runner;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::apply::{ApplyResult, ClientMappings};
    pub use crate::config::{ClientConfig, ControllerConfig};
    pub use crate::error::Error;
    pub use crate::k8s_types::{self, K8sType};
    pub use crate::namespace::Namespace;
    pub use crate::resource::K8sResource;
    pub use crate::runner::{run_controller, start_controller_with_runtime};
    pub use serde::{Deserialize, Serialize};
}
