//! Creates each object from a `Config` document, which is a list of arbitrary api objects:
//!
//! ```yaml
//! kind: Config
//! apiVersion: v1
//! items:
//! - kind: Service
//!   apiVersion: v1
//!   metadata:
//!     name: frontend
//! - kind: Route
//!   apiVersion: route.openshift.io/v1
//!   metadata:
//!     name: frontend
//! ```
//!
//! Only problems with the document as a whole are returned as an error. Every item is attempted,
//! and the outcome of each one is reported in its own `ApplyResult`. Items that were created
//! before a failure are not rolled back.
mod labels;
mod mapping;

pub use self::labels::{add_labels, LabelError, Labeled};
pub use self::mapping::{
    known_types, ClientMapping, ClientMappings, Codec, CodecError, JsonCodec, RestClient,
    RestMapper, TypedRestClient,
};

use crate::resource::{K8sResource, ResourceJson};
use crate::runner::metrics::ApplyMetrics;

use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

pub const CONFIG_KIND: &str = "Config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorType {
    Decode,
    Client,
    Encode,
    Create,
    Labels,
}

impl ValidationErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorType::Decode => "decode",
            ValidationErrorType::Client => "client",
            ValidationErrorType::Encode => "encode",
            ValidationErrorType::Create => "create",
            ValidationErrorType::Labels => "labels",
        }
    }
}

impl Display for ValidationErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A problem with a single item of the document
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// the path of the item within the document, for example `items[2]`
    pub field: String,
    pub error_type: ValidationErrorType,
    pub detail: String,
}

impl ValidationError {
    fn new(index: usize, error_type: ValidationErrorType, detail: impl Into<String>) -> Self {
        ValidationError {
            field: format!("items[{}]", index),
            error_type,
            detail: detail.into(),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} error: {}", self.field, self.error_type, self.detail)
    }
}

impl std::error::Error for ValidationError {}

/// The outcome of creating a single item
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplyResult {
    pub errors: Vec<ValidationError>,
    pub message: String,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn failed(error: ValidationError) -> ApplyResult {
        ApplyResult {
            message: error.to_string(),
            errors: vec![error],
        }
    }
}

#[derive(Debug)]
pub enum ApplyError {
    Decode(serde_yaml::Error),
    NotAnObject,
    WrongKind(String),
    EmptyItems,
}

impl Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApplyError::Decode(e) => write!(f, "failed to decode Config: {}", e),
            ApplyError::NotAnObject => f.write_str("Config must be an object"),
            ApplyError::WrongKind(kind) => {
                write!(f, "expected kind '{}' but got '{}'", CONFIG_KIND, kind)
            }
            ApplyError::EmptyItems => f.write_str("Config items must be not empty"),
        }
    }
}

impl std::error::Error for ApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApplyError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for ApplyError {
    fn from(err: serde_yaml::Error) -> ApplyError {
        ApplyError::Decode(err)
    }
}

/// Decodes the document, which may be either json or yaml, and returns its items
fn decode_items(data: &[u8]) -> Result<Vec<Value>, ApplyError> {
    let mut document: Value = serde_yaml::from_slice(data)?;
    let document = document.as_object_mut().ok_or(ApplyError::NotAnObject)?;

    if let Some(kind) = document.get("kind").filter(|k| !k.is_null()) {
        let kind = kind.as_str().unwrap_or_default();
        if kind != CONFIG_KIND {
            return Err(ApplyError::WrongKind(kind.to_owned()));
        }
    }

    match document.remove("items") {
        Some(Value::Array(items)) if !items.is_empty() => Ok(items),
        _ => Err(ApplyError::EmptyItems),
    }
}

/// Creates the items of `Config` documents. Build one at startup and reuse it.
#[derive(Debug, Clone)]
pub struct Applier {
    mapper: RestMapper,
    mappings: ClientMappings,
    labels: BTreeMap<String, String>,
    metrics: Option<ApplyMetrics>,
}

impl Applier {
    pub fn new(mapper: RestMapper, mappings: ClientMappings) -> Applier {
        Applier {
            mapper,
            mappings,
            labels: BTreeMap::new(),
            metrics: None,
        }
    }

    /// Adds the labels to every item that's created, and to the pod templates of items that
    /// have one
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Applier {
        self.labels = labels;
        self
    }

    pub fn with_metrics(mut self, metrics: ApplyMetrics) -> Applier {
        self.metrics = Some(metrics);
        self
    }

    /// Creates every item from the document in the given namespace. Returns one result per
    /// item, in the same order as the items.
    pub async fn apply(&self, namespace: &str, data: &[u8]) -> Result<Vec<ApplyResult>, ApplyError> {
        let items = decode_items(data)?;
        log::debug!(
            "Applying Config with {} items to namespace '{}'",
            items.len(),
            namespace
        );

        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let result = match self.apply_item(namespace, index, item).await {
                Ok(message) => {
                    log::info!("items[{}]: {}", index, message);
                    if let Some(metrics) = self.metrics.as_ref() {
                        metrics.item_created();
                    }
                    ApplyResult {
                        errors: Vec::new(),
                        message,
                    }
                }
                Err(error) => {
                    log::warn!("Failed to apply item to namespace '{}': {}", namespace, error);
                    if let Some(metrics) = self.metrics.as_ref() {
                        metrics.item_failed();
                    }
                    ApplyResult::failed(error)
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn apply_item(
        &self,
        namespace: &str,
        index: usize,
        item: Value,
    ) -> Result<String, ValidationError> {
        use self::ValidationErrorType::*;

        let mut resource = K8sResource::from_value(item)
            .map_err(|e| ValidationError::new(index, Decode, e.to_string()))?;
        let k8s_type = self
            .mapper
            .mapping_for(resource.api_version(), resource.kind())
            .ok_or_else(|| {
                let detail = format!(
                    "no kind '{}' is registered for version '{}'",
                    resource.kind(),
                    resource.api_version()
                );
                ValidationError::new(index, Decode, detail)
            })?;

        let mapping = self.mappings.get(k8s_type.plural_kind);
        let client = mapping
            .and_then(|m| m.client.as_ref())
            .ok_or_else(|| ValidationError::new(index, Client, "not supported"))?;

        add_labels(&mut resource, &self.labels)
            .map_err(|e| ValidationError::new(index, Labels, e.to_string()))?;

        let codec = mapping
            .and_then(|m| m.codec.as_ref())
            .ok_or_else(|| ValidationError::new(index, Encode, "no codec"))?;
        let body = codec
            .encode(&resource)
            .map_err(|e| ValidationError::new(index, Encode, e.to_string()))?;

        let created = client
            .create(namespace, body)
            .await
            .map_err(|e| ValidationError::new(index, Create, e.to_string()))?;

        let kind = created.get_kind().unwrap_or_else(|| resource.kind());
        let name = created.get_name().unwrap_or_else(|| resource.name());
        Ok(format!("Creation succeeded for {} with name {}", kind, name))
    }
}

/// Creates every item from the document using the default `RestMapper` and the given mappings
pub async fn apply(
    namespace: &str,
    data: &[u8],
    mappings: &ClientMappings,
) -> Result<Vec<ApplyResult>, ApplyError> {
    Applier::new(RestMapper::default(), mappings.clone())
        .apply(namespace, data)
        .await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn document_without_items_is_an_error() {
        for doc in &[r#"{}"#, r#"{"items": null}"#, r#"{"kind": "Config", "items": []}"#] {
            match decode_items(doc.as_bytes()) {
                Err(ApplyError::EmptyItems) => {}
                other => panic!("expected empty items error for {}, got: {:?}", doc, other),
            }
        }
        assert_eq!(
            "Config items must be not empty",
            ApplyError::EmptyItems.to_string()
        );
    }

    #[test]
    fn document_with_wrong_kind_is_an_error() {
        let err = decode_items(br#"{"kind": "List", "items": [{}]}"#).unwrap_err();
        assert_eq!("expected kind 'Config' but got 'List'", err.to_string());
    }

    #[test]
    fn invalid_document_is_an_error() {
        assert!(matches!(
            decode_items(b"{ not: [valid"),
            Err(ApplyError::Decode(_))
        ));
        assert!(matches!(
            decode_items(b"[1, 2]"),
            Err(ApplyError::NotAnObject)
        ));
    }

    #[test]
    fn yaml_documents_are_decoded() {
        let doc = "kind: Config\napiVersion: v1\nitems:\n- kind: Service\n  apiVersion: v1\n  metadata:\n    name: frontend\n";
        let items = decode_items(doc.as_bytes()).unwrap();
        assert_eq!(1, items.len());
        assert_eq!(Some("frontend"), items[0].get_name());
    }

    #[test]
    fn validation_error_includes_the_field_and_type() {
        let err = ValidationError::new(3, ValidationErrorType::Decode, "bad item");
        assert_eq!("items[3]: decode error: bad item", err.to_string());
    }
}
