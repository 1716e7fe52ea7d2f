//! The subset of the core/v1 Namespace that the finalizer controller reads and writes. Every
//! field that isn't modeled explicitly is kept in the `extra` maps, so that a namespace that's
//! read from the api server can be sent back to it without losing anything.
use crate::resource::JsonObject;

use serde_json::Value;

/// The finalizer token that's owned by the platform's project layer. It's added to each
/// namespace when the project is created, and removed by the namespace finalizer controller
/// once the namespace is terminating.
pub const ORIGIN_FINALIZER: &str = "openshift.io/origin";

pub const PHASE_ACTIVE: &str = "Active";
pub const PHASE_TERMINATING: &str = "Terminating";

fn default_api_version() -> String {
    "v1".to_owned()
}

fn default_kind() -> String {
    "Namespace".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub metadata: NamespaceMeta,
    #[serde(default)]
    pub spec: NamespaceSpec,
    #[serde(default)]
    pub status: NamespaceStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamespaceSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamespaceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl Namespace {
    /// Returns a new active namespace with no finalizers
    pub fn new(name: impl Into<String>) -> Namespace {
        Namespace {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: NamespaceMeta {
                name: name.into(),
                ..Default::default()
            },
            spec: NamespaceSpec::default(),
            status: NamespaceStatus {
                phase: Some(PHASE_ACTIVE.to_owned()),
                extra: JsonObject::new(),
            },
        }
    }

    pub fn from_value(value: Value) -> Result<Namespace, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_str()
    }

    pub fn phase(&self) -> Option<&str> {
        self.status.phase.as_ref().map(String::as_str)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.spec.finalizers.iter().any(|f| f == finalizer)
    }

    /// Only the phase counts. A deletion timestamp alone doesn't make a namespace terminating.
    pub fn is_terminating(&self) -> bool {
        self.phase() == Some(PHASE_TERMINATING)
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Removes the given finalizer. Finalizers are a set, so any duplicate entries are dropped
    /// along the way, while keeping the original order of the remaining ones. Returns true if
    /// the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let had_finalizer = self.has_finalizer(finalizer);
        let mut remaining: Vec<String> = Vec::with_capacity(self.spec.finalizers.len());
        for f in self.spec.finalizers.drain(..) {
            if f != finalizer && !remaining.contains(&f) {
                remaining.push(f);
            }
        }
        self.spec.finalizers = remaining;
        had_finalizer
    }

    pub fn with_finalizers<I, S>(mut self, finalizers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.finalizers = finalizers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.status.phase = Some(phase.into());
        self
    }

    pub fn with_deletion_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.metadata.deletion_timestamp = Some(timestamp.into());
        self
    }

    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.resource_version = Some(version.into());
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_are_preserved() {
        let input = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": "ns1",
                "resourceVersion": "42",
                "uid": "abc",
                "annotations": {"openshift.io/display-name": "My Project"}
            },
            "spec": {"finalizers": ["kubernetes", "openshift.io/origin"]},
            "status": {"phase": "Active"}
        });
        let ns = Namespace::from_value(input.clone()).expect("failed to deserialize");
        assert_eq!("ns1", ns.name());
        assert_eq!(Some("42"), ns.metadata.resource_version.as_ref().map(String::as_str));
        let output = serde_json::to_value(&ns).expect("failed to serialize");
        assert_eq!(input, output);
    }

    #[test]
    fn only_the_terminating_phase_counts_as_terminating() {
        let ns = Namespace::new("foo");
        assert!(!ns.is_terminating());
        let ns = ns.with_deletion_timestamp("2019-10-01T00:00:00Z");
        assert!(ns.is_marked_for_deletion());
        assert!(!ns.is_terminating());
        let ns = Namespace::new("bar").with_phase(PHASE_TERMINATING);
        assert!(ns.is_terminating());
    }

    #[test]
    fn remove_finalizer_treats_finalizers_as_a_set() {
        let mut ns = Namespace::new("foo").with_finalizers(vec![
            "kubernetes",
            ORIGIN_FINALIZER,
            "kubernetes",
            ORIGIN_FINALIZER,
            "other",
        ]);
        assert!(ns.remove_finalizer(ORIGIN_FINALIZER));
        assert_eq!(vec!["kubernetes".to_owned(), "other".to_owned()], ns.spec.finalizers);
        assert!(!ns.remove_finalizer(ORIGIN_FINALIZER));
    }
}
