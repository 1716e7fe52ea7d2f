//! Resolving an arbitrary object to the client that creates it. The `RestMapper` identifies the
//! resource type from an object's `apiVersion` and `kind`, and the `ClientMappings` hold the
//! client and codec to use for each resource type, keyed by its plural name.
use crate::k8s_types::{
    apps, apps_openshift_io, authorization_openshift_io, batch, build_openshift_io, core,
    image_openshift_io, route_openshift_io, security_openshift_io, template_openshift_io,
    K8sType,
};
use crate::resource::{InvalidResourceError, K8sResource};
use crate::runner::client::{Client, Error as ClientError};

use async_trait::async_trait;
use serde_json::Value;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

/// All of the types that the `RestMapper` knows about by default
pub fn known_types() -> Vec<&'static K8sType> {
    vec![
        core::v1::Namespace,
        core::v1::Pod,
        core::v1::PodTemplate,
        core::v1::ReplicationController,
        core::v1::Service,
        core::v1::Endpoints,
        core::v1::Secret,
        core::v1::ConfigMap,
        core::v1::LimitRange,
        core::v1::PersistentVolumeClaim,
        core::v1::ResourceQuota,
        core::v1::ServiceAccount,
        apps::v1::DaemonSet,
        apps::v1::Deployment,
        apps::v1::ReplicaSet,
        apps::v1::StatefulSet,
        batch::v1::Job,
        apps_openshift_io::v1::DeploymentConfig,
        authorization_openshift_io::v1::Policy,
        authorization_openshift_io::v1::PolicyBinding,
        authorization_openshift_io::v1::Role,
        authorization_openshift_io::v1::RoleBinding,
        build_openshift_io::v1::BuildConfig,
        build_openshift_io::v1::Build,
        image_openshift_io::v1::ImageStream,
        route_openshift_io::v1::Route,
        security_openshift_io::v1::SecurityContextConstraints,
        template_openshift_io::v1::Template,
    ]
}

/// Maps `apiVersion` and `kind` to a resource type
#[derive(Debug, Clone)]
pub struct RestMapper {
    types: Vec<&'static K8sType>,
}

impl RestMapper {
    /// Returns a mapper that doesn't know about any types
    pub fn empty() -> RestMapper {
        RestMapper { types: Vec::new() }
    }

    /// Adds the type, replacing any existing type with the same `apiVersion` and `kind`
    pub fn register(&mut self, k8s_type: &'static K8sType) {
        self.types
            .retain(|t| !t.matches(k8s_type.api_version, k8s_type.kind));
        self.types.push(k8s_type);
    }

    pub fn with_type(mut self, k8s_type: &'static K8sType) -> RestMapper {
        self.register(k8s_type);
        self
    }

    pub fn mapping_for(&self, api_version: &str, kind: &str) -> Option<&'static K8sType> {
        self.types
            .iter()
            .copied()
            .find(|t| t.matches(api_version, kind))
    }
}

impl Default for RestMapper {
    fn default() -> RestMapper {
        known_types()
            .into_iter()
            .fold(RestMapper::empty(), RestMapper::with_type)
    }
}

#[derive(Debug)]
pub enum CodecError {
    Serde(serde_json::Error),
    Invalid(InvalidResourceError),
}

impl Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Serde(e) => write!(f, "{}", e),
            CodecError::Invalid(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Serde(e) => Some(e),
            CodecError::Invalid(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> CodecError {
        CodecError::Serde(err)
    }
}

impl From<InvalidResourceError> for CodecError {
    fn from(err: InvalidResourceError) -> CodecError {
        CodecError::Invalid(err)
    }
}

/// Converts resources to and from the wire format used by a client
pub trait Codec: Send + Sync {
    fn encode(&self, resource: &K8sResource) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<K8sResource, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, resource: &K8sResource) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(resource).map_err(Into::into)
    }

    fn decode(&self, data: &[u8]) -> Result<K8sResource, CodecError> {
        let value: Value = serde_json::from_slice(data)?;
        K8sResource::from_value(value).map_err(Into::into)
    }
}

/// Creates objects of a single resource type
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Creates the object from its encoded form, returning the object as it was persisted
    async fn create(&self, namespace: &str, body: Vec<u8>) -> Result<Value, ClientError>;
}

#[derive(Debug, Clone)]
pub struct TypedRestClient {
    client: Client,
    k8s_type: &'static K8sType,
}

impl TypedRestClient {
    pub fn new(client: Client, k8s_type: &'static K8sType) -> TypedRestClient {
        TypedRestClient { client, k8s_type }
    }
}

#[async_trait]
impl RestClient for TypedRestClient {
    async fn create(&self, namespace: &str, body: Vec<u8>) -> Result<Value, ClientError> {
        self.client
            .create_resource(self.k8s_type, Some(namespace), body)
            .await
    }
}

/// The client and codec for a resource type. Either may be missing, in which case objects of
/// that type can't be created.
#[derive(Clone, Default)]
pub struct ClientMapping {
    pub client: Option<Arc<dyn RestClient>>,
    pub codec: Option<Arc<dyn Codec>>,
}

impl ClientMapping {
    pub fn new(client: Arc<dyn RestClient>, codec: Arc<dyn Codec>) -> ClientMapping {
        ClientMapping {
            client: Some(client),
            codec: Some(codec),
        }
    }
}

impl fmt::Debug for ClientMapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientMapping")
            .field("has_client", &self.client.is_some())
            .field("has_codec", &self.codec.is_some())
            .finish()
    }
}

/// Client mappings keyed by the plural resource name, for example `buildconfigs`
#[derive(Debug, Clone, Default)]
pub struct ClientMappings(HashMap<String, ClientMapping>);

impl ClientMappings {
    pub fn new() -> ClientMappings {
        ClientMappings::default()
    }

    /// Creates a mapping for each of the given types that uses the client and the json codec
    pub fn for_client(client: &Client, k8s_types: &[&'static K8sType]) -> ClientMappings {
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let mut mappings = ClientMappings::new();
        for k8s_type in k8s_types.iter().copied() {
            let rest_client = Arc::new(TypedRestClient::new(client.clone(), k8s_type));
            mappings.insert(k8s_type.plural_kind, ClientMapping::new(rest_client, codec.clone()));
        }
        mappings
    }

    pub fn insert(&mut self, plural_kind: impl Into<String>, mapping: ClientMapping) {
        self.0.insert(plural_kind.into(), mapping);
    }

    pub fn with_mapping(mut self, plural_kind: impl Into<String>, mapping: ClientMapping) -> Self {
        self.insert(plural_kind, mapping);
        self
    }

    pub fn get(&self, plural_kind: &str) -> Option<&ClientMapping> {
        self.0.get(plural_kind)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_mapper_resolves_known_kinds() {
        let mapper = RestMapper::default();
        let build_config = mapper
            .mapping_for("build.openshift.io/v1", "BuildConfig")
            .expect("no mapping for BuildConfig");
        assert_eq!("buildconfigs", build_config.plural_kind);
        assert_eq!(
            Some(core::v1::Service),
            mapper.mapping_for("v1", "Service")
        );
        assert!(mapper.mapping_for("v1", "Widget").is_none());
        assert!(mapper.mapping_for("v2", "Service").is_none());
    }

    #[test]
    fn json_codec_preserves_identifying_fields() {
        let resource = K8sResource::from_value(json!({
            "apiVersion": "route.openshift.io/v1",
            "kind": "Route",
            "metadata": {
                "name": "frontend",
                "resourceVersion": "1234"
            },
            "spec": {"host": "www.example.com"}
        }))
        .unwrap();

        let codec = JsonCodec;
        let decoded = codec.decode(&codec.encode(&resource).unwrap()).unwrap();
        assert_eq!("route.openshift.io/v1", decoded.api_version());
        assert_eq!("Route", decoded.kind());
        assert_eq!("frontend", decoded.name());
        assert_eq!(Some("1234"), decoded.resource_version());
        assert_eq!(resource, decoded);
    }

    #[test]
    fn json_codec_rejects_objects_without_a_name() {
        let err = JsonCodec
            .decode(br#"{"apiVersion": "v1", "kind": "Service", "metadata": {}}"#)
            .unwrap_err();
        match err {
            CodecError::Invalid(e) => assert_eq!("missing metadata.name", e.message),
            other => panic!("expected invalid resource error, got: {}", other),
        }
    }
}
