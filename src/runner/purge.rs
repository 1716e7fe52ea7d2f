//! Deletes the platform resources that live inside a namespace before the namespace is finalized.
//! The kinds are purged one after the other, in a fixed order. The first failure aborts the
//! purge, and the whole thing is retried the next time the namespace is synced. Resources that
//! have already been deleted by the time we get to them are not a failure.
use crate::k8s_types::{
    apps_openshift_io, authorization_openshift_io, build_openshift_io, core, image_openshift_io,
    route_openshift_io, security_openshift_io, template_openshift_io, K8sType,
};
use crate::resource::{ObjectIdRef, ResourceJson};
use crate::runner::api::ResourceApi;
use crate::runner::client::Error as ClientError;

use serde_json::Value;

use std::collections::BTreeSet;
use std::fmt::{self, Display};

const SERVICE_ACCOUNTS_GROUP_PREFIX: &str = "system:serviceaccounts:";

/// The kinds that are purged from a namespace, in the order they're deleted. Service accounts
/// referenced by security context constraints are handled separately, after all of these.
pub fn dependent_types() -> [&'static K8sType; 10] {
    [
        build_openshift_io::v1::BuildConfig,
        build_openshift_io::v1::Build,
        apps_openshift_io::v1::DeploymentConfig,
        image_openshift_io::v1::ImageStream,
        authorization_openshift_io::v1::Policy,
        authorization_openshift_io::v1::PolicyBinding,
        authorization_openshift_io::v1::RoleBinding,
        authorization_openshift_io::v1::Role,
        route_openshift_io::v1::Route,
        template_openshift_io::v1::Template,
    ]
}

#[derive(Debug)]
pub enum PurgeError {
    List {
        k8s_type: &'static K8sType,
        error: ClientError,
    },
    Delete {
        k8s_type: &'static K8sType,
        name: String,
        error: ClientError,
    },
}

impl Display for PurgeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PurgeError::List { k8s_type, error } => {
                write!(f, "failed to list {}: {}", k8s_type, error)
            }
            PurgeError::Delete {
                k8s_type,
                name,
                error,
            } => write!(f, "failed to delete {} '{}': {}", k8s_type, name, error),
        }
    }
}

impl std::error::Error for PurgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PurgeError::List { error, .. } => Some(error),
            PurgeError::Delete { error, .. } => Some(error),
        }
    }
}

/// Deletes all of the dependent resources in the namespace
pub async fn purge_dependents(api: &dyn ResourceApi, namespace: &str) -> Result<(), PurgeError> {
    log::info!("Purging dependent resources from namespace: '{}'", namespace);
    let mut total = 0;
    for k8s_type in dependent_types().iter().copied() {
        total += delete_all(api, k8s_type, namespace).await?;
    }
    total += delete_referenced_service_accounts(api, namespace).await?;
    log::info!(
        "Finished purging namespace: '{}', deleted {} resources",
        namespace,
        total
    );
    Ok(())
}

async fn list(
    api: &dyn ResourceApi,
    k8s_type: &'static K8sType,
    namespace: Option<&str>,
) -> Result<Vec<Value>, PurgeError> {
    api.list_all(k8s_type, namespace)
        .await
        .map_err(|error| PurgeError::List { k8s_type, error })
}

async fn delete(
    api: &dyn ResourceApi,
    k8s_type: &'static K8sType,
    namespace: &str,
    name: &str,
) -> Result<bool, PurgeError> {
    let id = ObjectIdRef::new(namespace, name);
    match api.delete_resource(k8s_type, &id).await {
        Ok(()) => Ok(true),
        Err(ref err) if err.is_not_found() => {
            log::debug!("{} '{}' was already deleted", k8s_type, id);
            Ok(false)
        }
        Err(error) => Err(PurgeError::Delete {
            k8s_type,
            name: name.to_owned(),
            error,
        }),
    }
}

async fn delete_all(
    api: &dyn ResourceApi,
    k8s_type: &'static K8sType,
    namespace: &str,
) -> Result<usize, PurgeError> {
    let items = list(api, k8s_type, Some(namespace)).await?;
    let mut deleted = 0;
    for item in items.iter() {
        let name = match item.get_name() {
            Some(n) => n,
            None => {
                log::warn!("Skipping {} item without a name in namespace '{}'", k8s_type, namespace);
                continue;
            }
        };
        if delete(api, k8s_type, namespace, name).await? {
            deleted += 1;
        }
    }
    log::debug!("Deleted {} {} from namespace '{}'", deleted, k8s_type, namespace);
    Ok(deleted)
}

/// When any security context constraint grants the namespace's service accounts group, every
/// service account in the namespace is deleted too.
async fn delete_referenced_service_accounts(
    api: &dyn ResourceApi,
    namespace: &str,
) -> Result<usize, PurgeError> {
    let constraints = list(
        api,
        security_openshift_io::v1::SecurityContextConstraints,
        None,
    )
    .await?;

    let namespace_group = format!("{}{}", SERVICE_ACCOUNTS_GROUP_PREFIX, namespace);
    let referenced = constraints
        .iter()
        .any(|scc| string_array(scc, "groups").any(|group| group == namespace_group));
    if !referenced {
        return Ok(0);
    }

    let accounts = list(api, core::v1::ServiceAccount, Some(namespace)).await?;
    let names = accounts
        .iter()
        .filter_map(|sa| sa.get_name())
        .collect::<BTreeSet<_>>();

    let mut deleted = 0;
    for name in names {
        if delete(api, core::v1::ServiceAccount, namespace, name).await? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

fn string_array<'a>(value: &'a Value, field: &str) -> impl Iterator<Item = &'a str> + 'a {
    value
        .get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flat_map(|values| values.iter())
        .filter_map(Value::as_str)
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::runtime;

    #[derive(Default)]
    struct FakeResources {
        objects: HashMap<&'static str, Vec<Value>>,
        lists: Mutex<Vec<&'static str>>,
        deletes: Mutex<Vec<String>>,
        fail_deletes_of: Option<&'static str>,
    }

    #[async_trait]
    impl ResourceApi for FakeResources {
        async fn list_all(
            &self,
            k8s_type: &'static K8sType,
            _namespace: Option<&str>,
        ) -> Result<Vec<Value>, ClientError> {
            self.lists.lock().unwrap().push(k8s_type.plural_kind);
            Ok(self
                .objects
                .get(k8s_type.plural_kind)
                .cloned()
                .unwrap_or_default())
        }

        async fn delete_resource(
            &self,
            k8s_type: &'static K8sType,
            id: &ObjectIdRef<'_>,
        ) -> Result<(), ClientError> {
            if Some(k8s_type.plural_kind) == self.fail_deletes_of {
                return Err(ClientError::http(http::StatusCode::FORBIDDEN));
            }
            self.deletes
                .lock()
                .unwrap()
                .push(format!("{}/{}", k8s_type.plural_kind, id));
            if id.name() == "already-gone" {
                Err(ClientError::not_found())
            } else {
                Ok(())
            }
        }
    }

    fn named(name: &str) -> Value {
        json!({"metadata": {"name": name}})
    }

    #[test]
    fn every_dependent_kind_is_listed_once_in_order() {
        let mut objects = HashMap::new();
        objects.insert("builds", vec![named("b1"), named("already-gone")]);
        objects.insert("routes", vec![named("frontend")]);
        let api = FakeResources {
            objects,
            ..Default::default()
        };

        runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(purge_dependents(&api, "ns1"))
            .expect("purge failed");

        let mut expected = dependent_types()
            .iter()
            .map(|t| t.plural_kind)
            .collect::<Vec<_>>();
        expected.push("securitycontextconstraints");
        assert_eq!(expected, *api.lists.lock().unwrap());
        assert_eq!(
            vec![
                "builds/ns1/b1".to_owned(),
                "builds/ns1/already-gone".to_owned(),
                "routes/ns1/frontend".to_owned(),
            ],
            *api.deletes.lock().unwrap()
        );
    }

    fn purge_service_accounts(constraints: Vec<Value>) -> FakeResources {
        let mut objects = HashMap::new();
        objects.insert("securitycontextconstraints", constraints);
        objects.insert("serviceaccounts", vec![named("default"), named("builder")]);
        let api = FakeResources {
            objects,
            ..Default::default()
        };

        runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(purge_dependents(&api, "ns1"))
            .expect("purge failed");
        api
    }

    #[test]
    fn service_accounts_are_deleted_when_a_constraint_grants_the_namespace_group() {
        let api = purge_service_accounts(vec![
            json!({
                "metadata": {"name": "privileged"},
                "groups": ["system:serviceaccounts:other"]
            }),
            json!({
                "metadata": {"name": "restricted"},
                "users": null,
                "groups": ["system:serviceaccounts:ns1"]
            }),
        ]);

        assert_eq!(
            vec![
                "serviceaccounts/ns1/builder".to_owned(),
                "serviceaccounts/ns1/default".to_owned(),
            ],
            *api.deletes.lock().unwrap()
        );
    }

    #[test]
    fn service_accounts_named_only_as_constraint_users_are_kept() {
        let api = purge_service_accounts(vec![json!({
            "metadata": {"name": "privileged"},
            "users": ["system:serviceaccount:ns1:builder"],
            "groups": ["system:serviceaccounts:other"]
        })]);

        assert!(api.deletes.lock().unwrap().is_empty());
        assert!(!api.lists.lock().unwrap().contains(&"serviceaccounts"));
    }

    #[test]
    fn delete_failure_aborts_the_purge() {
        let mut objects = HashMap::new();
        objects.insert("buildconfigs", vec![named("bc1")]);
        objects.insert("routes", vec![named("frontend")]);
        let api = FakeResources {
            objects,
            fail_deletes_of: Some("buildconfigs"),
            ..Default::default()
        };

        let err = runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(purge_dependents(&api, "ns1"))
            .unwrap_err();
        match err {
            PurgeError::Delete { k8s_type, name, .. } => {
                assert_eq!("buildconfigs", k8s_type.plural_kind);
                assert_eq!("bc1", name);
            }
            other => panic!("expected delete error, got: {}", other),
        }
        assert_eq!(vec!["buildconfigs"], *api.lists.lock().unwrap());
        assert!(api.deletes.lock().unwrap().is_empty());
    }
}
