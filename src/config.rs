//! Configuration for the controller and for connecting to the Kubernetes api server.
//!
//! `ControllerConfig` describes how the namespace finalizer controller behaves: how many
//! workers it runs, which finalizer token it owns, how failed syncs are retried, and
//! whether the metrics and health endpoints are served. `ClientConfig` describes how to
//! reach the api server, and can be loaded either from the pod's service account or from
//! a kubeconfig file.
mod kubeconfig;

pub use self::kubeconfig::{KubeConfig, KubeConfigError};

use crate::namespace::ORIGIN_FINALIZER;

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONTROLLER_NAME: &str = "origin-namespace-controller";
pub const DEFAULT_WORKER_COUNT: usize = 5;
pub const DEFAULT_SERVER_PORT: u16 = 8080;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

/// Limits applied to requeues of keys that failed to sync. The effective delay for a key is the
/// larger of its per-key exponential backoff and the delay imposed by the overall token bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// delay for the first retry of a key
    pub base_delay: Duration,
    /// upper bound for the per-key exponential delay
    pub max_delay: Duration,
    /// sustained rate of requeues across all keys
    pub qps: f64,
    /// number of requeues allowed in a burst before `qps` applies
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

/// Configuration of the namespace finalizer controller. Create one with `ControllerConfig::new`
/// and customize it with the builder style functions.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Used as the user agent for all requests to the api server
    pub controller_name: String,
    /// The finalizer token that this controller owns and removes from terminating namespaces
    pub finalizer_name: String,
    /// Number of workers that process namespace keys concurrently
    pub workers: usize,
    /// Whether dependent resources are deleted from a namespace before its finalizer is removed
    pub purge_dependents: bool,
    /// Maximum number of times a key is retried before being dropped. `None` retries forever.
    pub max_retries: Option<u32>,
    pub rate_limits: RateLimitConfig,
    pub server_port: u16,
    pub expose_metrics: bool,
    pub expose_health: bool,
}

impl ControllerConfig {
    pub fn new(controller_name: impl Into<String>) -> ControllerConfig {
        ControllerConfig {
            controller_name: controller_name.into(),
            finalizer_name: ORIGIN_FINALIZER.to_owned(),
            workers: DEFAULT_WORKER_COUNT,
            purge_dependents: false,
            max_retries: None,
            rate_limits: RateLimitConfig::default(),
            server_port: DEFAULT_SERVER_PORT,
            expose_metrics: true,
            expose_health: true,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_finalizer_name(mut self, finalizer_name: impl Into<String>) -> Self {
        self.finalizer_name = finalizer_name.into();
        self
    }

    /// Enables deleting all of the dependent platform resources (builds, routes, policies, etc) in a
    /// namespace before its finalizer is removed.
    pub fn purge_dependents(mut self, purge: bool) -> Self {
        self.purge_dependents = purge;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_rate_limits(mut self, rate_limits: RateLimitConfig) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn expose_metrics(mut self, expose: bool) -> Self {
        self.expose_metrics = expose;
        self
    }

    pub fn expose_health(mut self, expose: bool) -> Self {
        self.expose_health = expose;
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig::new(DEFAULT_CONTROLLER_NAME)
    }
}

/// Where to find the CA certificate(s) used to verify the api server
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    /// base64 encoded PEM contents, as they appear in `certificate-authority-data`
    Contents(String),
    /// path to a PEM file
    File(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    /// A complete value for the `Authorization` header
    Header(String),
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
}

impl Credentials {
    pub fn base64_bearer_token(token: impl AsRef<str>) -> Credentials {
        Credentials::Header(format!("Bearer {}", token.as_ref().trim()))
    }

    pub fn basic(username: &str, password: &str) -> Credentials {
        let encoded = base64::encode(format!("{}:{}", username, password).as_bytes());
        Credentials::Header(format!("Basic {}", encoded))
    }

    pub(crate) fn header_value(&self) -> Option<&str> {
        match self {
            Credentials::Header(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub credentials: Credentials,
    pub ca_data: Option<CAData>,
    pub user_agent: String,
    pub impersonate: Option<String>,
    pub impersonate_groups: Vec<String>,
    pub verify_ssl_certs: bool,
}

impl ClientConfig {
    /// Loads the configuration from the service account that is mounted into every pod
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, io::Error> {
        let mut token_file = File::open(SERVICE_ACCOUNT_TOKEN_PATH)?;
        let mut service_account_token = String::new();
        token_file.read_to_string(&mut service_account_token)?;

        let ca_data = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(CAData::File(SERVICE_ACCOUNT_CA_PATH.to_owned()))
        } else {
            None
        };

        let api_server_endpoint = match (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) {
            (Ok(host), Ok(port)) => format!("https://{}:{}", host, port),
            _ => format!("https://{}", API_SERVER_HOSTNAME),
        };
        Ok(ClientConfig {
            api_server_endpoint,
            credentials: Credentials::base64_bearer_token(service_account_token),
            ca_data,
            user_agent: user_agent.into(),
            impersonate: None,
            impersonate_groups: Vec::new(),
            verify_ssl_certs: true,
        })
    }

    /// Loads the configuration from the kubeconfig file pointed to by `KUBECONFIG`, or from
    /// `~/.kube/config`, using its current context.
    pub fn from_kubeconfig(user_agent: impl Into<String>) -> Result<ClientConfig, KubeConfigError> {
        self::kubeconfig::load_from_kubeconfig(user_agent.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn controller_config_defaults() {
        let conf = ControllerConfig::default();
        assert_eq!(DEFAULT_CONTROLLER_NAME, conf.controller_name);
        assert_eq!(ORIGIN_FINALIZER, conf.finalizer_name);
        assert_eq!(5, conf.workers);
        assert!(!conf.purge_dependents);
        assert_eq!(None, conf.max_retries);
    }

    #[test]
    fn worker_count_is_at_least_one() {
        let conf = ControllerConfig::new("foo").with_workers(0);
        assert_eq!(1, conf.workers);
    }

    #[test]
    fn basic_credentials_are_base64_encoded() {
        let creds = Credentials::basic("admin", "secret");
        assert_eq!(Some("Basic YWRtaW46c2VjcmV0"), creds.header_value());
    }

    #[test]
    fn bearer_token_is_trimmed() {
        let creds = Credentials::base64_bearer_token("abc123\n");
        assert_eq!(Some("Bearer abc123"), creds.header_value());
    }
}
