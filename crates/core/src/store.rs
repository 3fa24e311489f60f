//! Object-store and applicator contracts. The reconcilers only ever talk to a
//! cluster through these traits; `tandem-kubehub` and `tandem-apply` provide the
//! Kubernetes-backed implementations.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::ResourceExt;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use crate::error::StoreError;

/// Identity of a single object (the reconcile request).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectKey {
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self { name: name.into(), namespace }
    }

    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: Some(namespace.into()) }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: None }
    }
}

impl From<&DynamicObject> for ObjectKey {
    fn from(obj: &DynamicObject) -> Self {
        Self { name: obj.name_any(), namespace: obj.namespace() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Minimal CRUD surface of one cluster's API store.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch by key. Absence is reported as [`StoreError::NotFound`].
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, StoreError>;

    /// Replace the object (metadata and body), returning the stored version.
    async fn update(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Write `obj.data.status` to the status subresource.
    async fn update_status(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<(), StoreError>;

    /// Delete the object. Deleting an absent object succeeds.
    async fn delete(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<(), StoreError>;

    /// List members of a kind across namespaces.
    async fn list(&self, resource: &ApiResource, params: &ListParams) -> Result<Vec<DynamicObject>, StoreError>;
}

/// Create-or-update (upsert) of a desired object.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait Applicator: Send + Sync {
    async fn apply(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;
}

/// A store paired with an applicator for the same cluster.
#[derive(Clone)]
pub struct ClientApplicator {
    pub client: Arc<dyn ObjectStore>,
    pub applicator: Arc<dyn Applicator>,
}

impl ClientApplicator {
    pub fn new(client: Arc<dyn ObjectStore>, applicator: Arc<dyn Applicator>) -> Self {
        Self { client, applicator }
    }
}
