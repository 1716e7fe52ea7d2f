use crate::resource::{JsonObject, K8sResource};

use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// Something that carries labels, and possibly a pod template with labels of its own
pub trait Labeled {
    /// The object's own labels, created if they don't exist yet. Returns `None` if the object
    /// has labels that aren't a json object.
    fn labels_mut(&mut self) -> Option<&mut JsonObject>;

    /// The labels of the pod template, for kinds that have one
    fn pod_template_labels_mut(&mut self) -> Option<&mut JsonObject> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LabelError {
    InvalidLabels,
    Conflict {
        key: String,
        existing: String,
        requested: String,
    },
}

impl Display for LabelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LabelError::InvalidLabels => f.write_str("existing labels are not a json object"),
            LabelError::Conflict {
                key,
                existing,
                requested,
            } => write!(
                f,
                "label '{}' already has value '{}', which conflicts with '{}'",
                key, existing, requested
            ),
        }
    }
}

impl std::error::Error for LabelError {}

fn child_object<'a>(parent: &'a mut JsonObject, key: &str) -> Option<&'a mut JsonObject> {
    let child = parent
        .entry(key)
        .or_insert_with(|| Value::Object(JsonObject::new()));
    if child.is_null() {
        *child = Value::Object(JsonObject::new());
    }
    child.as_object_mut()
}

impl Labeled for K8sResource {
    fn labels_mut(&mut self) -> Option<&mut JsonObject> {
        let metadata = self.value_mut().get_mut("metadata")?.as_object_mut()?;
        child_object(metadata, "labels")
    }

    fn pod_template_labels_mut(&mut self) -> Option<&mut JsonObject> {
        let template = self
            .value_mut()
            .pointer_mut("/spec/template")?
            .as_object_mut()?;
        let metadata = child_object(template, "metadata")?;
        child_object(metadata, "labels")
    }
}

fn merge(target: &mut JsonObject, labels: &BTreeMap<String, String>) -> Result<(), LabelError> {
    for (key, value) in labels.iter() {
        match target.get(key) {
            Some(Value::String(existing)) if existing == value => {}
            Some(existing) => {
                return Err(LabelError::Conflict {
                    key: key.clone(),
                    existing: existing.as_str().map(String::from).unwrap_or_else(|| existing.to_string()),
                    requested: value.clone(),
                });
            }
            None => {
                target.insert(key.clone(), Value::String(value.clone()));
            }
        }
    }
    Ok(())
}

/// Adds the labels to the object and to its pod template, if it has one. A label that's
/// already present with a different value is an error.
pub fn add_labels<T: Labeled + ?Sized>(
    target: &mut T,
    labels: &BTreeMap<String, String>,
) -> Result<(), LabelError> {
    if labels.is_empty() {
        return Ok(());
    }
    let object_labels = target.labels_mut().ok_or(LabelError::InvalidLabels)?;
    merge(object_labels, labels)?;
    if let Some(template_labels) = target.pod_template_labels_mut() {
        merge(template_labels, labels)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn labels() -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_owned(), "frontend".to_owned());
        labels
    }

    #[test]
    fn labels_are_added_to_object_and_pod_template() {
        let mut resource = K8sResource::from_value(json!({
            "apiVersion": "apps.openshift.io/v1",
            "kind": "DeploymentConfig",
            "metadata": {"name": "frontend", "labels": {"tier": "web"}},
            "spec": {"template": {"spec": {}}}
        }))
        .unwrap();

        add_labels(&mut resource, &labels()).unwrap();
        assert_eq!(Some("frontend"), resource.get_label_value("app"));
        assert_eq!(Some("web"), resource.get_label_value("tier"));
        assert_eq!(
            &json!({"app": "frontend"}),
            resource
                .as_ref()
                .pointer("/spec/template/metadata/labels")
                .unwrap()
        );
    }

    #[test]
    fn kinds_without_a_pod_template_only_get_object_labels() {
        let mut resource = K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "frontend", "labels": null},
            "spec": {"ports": []}
        }))
        .unwrap();

        add_labels(&mut resource, &labels()).unwrap();
        assert_eq!(Some("frontend"), resource.get_label_value("app"));
        assert!(resource.as_ref().pointer("/spec/template").is_none());
    }

    #[test]
    fn conflicting_label_is_an_error() {
        let mut resource = K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "frontend", "labels": {"app": "backend"}}
        }))
        .unwrap();

        let err = add_labels(&mut resource, &labels()).unwrap_err();
        assert_eq!(
            LabelError::Conflict {
                key: "app".to_owned(),
                existing: "backend".to_owned(),
                requested: "frontend".to_owned(),
            },
            err
        );
    }
}
