//! Generic, untyped Kubernetes resources. The config applier deals with arbitrary kinds of
//! objects, so they're kept as json and only the common `metadata` fields are accessed, through
//! the `ResourceJson` trait.
mod json_ext;
mod object_id;

pub use self::json_ext::ResourceJson;
pub use self::object_id::{ObjectId, ObjectIdRef};

use serde_json::Value;

pub type JsonObject = serde_json::Map<String, Value>;

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl std::fmt::Display for InvalidResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

/// A json object that is known to have an `apiVersion`, a `kind`, and a `metadata.name`. Those
/// are the minimum that's required to send it to the api server.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sResource(Value);

impl K8sResource {
    pub fn from_value(value: Value) -> Result<K8sResource, InvalidResourceError> {
        if let Err(msg) = K8sResource::validate(&value) {
            Err(InvalidResourceError {
                message: msg,
                value,
            })
        } else {
            Ok(K8sResource(value))
        }
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn name(&self) -> &str {
        self.0.get_name().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.get_namespace()
    }

    pub fn api_version(&self) -> &str {
        self.0.get_api_version().unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.0.get_kind().unwrap_or_default()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.0.get_resource_version()
    }

    pub fn get_label_value(&self, label: &str) -> Option<&str> {
        let labels = self.0.pointer("/metadata/labels")?.as_object()?;
        labels.get(label).and_then(Value::as_str)
    }

    pub fn get_object_id(&self) -> ObjectIdRef {
        ObjectIdRef::new(self.namespace().unwrap_or(""), self.name())
    }

    pub(crate) fn value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    fn validate(value: &Value) -> Result<(), &'static str> {
        if !value.is_object() {
            return Err("resource must be a json object");
        }
        value.get_api_version().ok_or("missing apiVersion")?;
        value.get_kind().ok_or("missing kind")?;
        value.get_name().ok_or("missing metadata.name")?;
        Ok(())
    }
}

impl std::convert::AsRef<Value> for K8sResource {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl Into<Value> for K8sResource {
    fn into(self) -> Value {
        self.into_value()
    }
}

impl std::fmt::Display for K8sResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
