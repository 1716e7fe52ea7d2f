//! The capabilities that the controller needs from the api server, split up so that each part of
//! the controller only depends on what it actually uses. `Client` implements all of them, and
//! tests can substitute their own implementations.
use crate::k8s_types::{self, K8sType};
use crate::namespace::Namespace;
use crate::resource::ObjectIdRef;
use crate::runner::client::{Client, Error, ObjectList, WatchEvent};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

/// Read access to namespaces, typically served from an informer's cache
#[async_trait]
pub trait NamespaceLister: Send + Sync {
    /// Returns `Ok(None)` if the namespace doesn't exist
    async fn get(&self, name: &str) -> Result<Option<Namespace>, anyhow::Error>;
}

#[async_trait]
pub trait NamespaceApi: Send + Sync {
    /// Replaces the namespace using the `finalize` subresource, returning the updated namespace
    async fn finalize(&self, namespace: &Namespace) -> Result<Namespace, Error>;
}

/// Untyped access to arbitrary resources, used for purging the contents of a namespace
#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn list_all(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>, Error>;

    /// Deletes the resource. A resource that doesn't exist is reported as a not found error.
    async fn delete_resource(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<(), Error>;
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent<Namespace>, Error>>;

/// The list and watch calls that back a namespace informer
#[async_trait]
pub trait NamespaceListWatch: Send + Sync + 'static {
    async fn list(&self) -> Result<ObjectList<Namespace>, Error>;
    async fn watch(&self, resource_version: &str) -> Result<WatchStream, Error>;
}

#[async_trait]
impl NamespaceApi for Client {
    async fn finalize(&self, namespace: &Namespace) -> Result<Namespace, Error> {
        self.finalize_namespace(namespace).await
    }
}

#[async_trait]
impl ResourceApi for Client {
    async fn list_all(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>, Error> {
        let list = Client::list_all::<Value>(self, k8s_type, namespace, None).await?;
        Ok(list.items)
    }

    async fn delete_resource(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<(), Error> {
        Client::delete_resource(self, k8s_type, id).await
    }
}

#[async_trait]
impl NamespaceListWatch for Client {
    async fn list(&self) -> Result<ObjectList<Namespace>, Error> {
        self.list_all(k8s_types::core::v1::Namespace, None, None)
            .await
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, Error> {
        let events = Client::watch::<Namespace>(
            self,
            k8s_types::core::v1::Namespace,
            None,
            Some(resource_version),
            None,
        )
        .await?;
        let stream = stream::unfold(events, |mut events| async move {
            events.next().await.map(|event| (event, events))
        });
        Ok(stream.boxed())
    }
}
