//! Single-capability strategies injected into the reconcilers, with the default
//! implementations used by the agent binary.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::ResourceExt;
use serde_json::Value as Json;
use tandem_apply::{sanitize, strip_status};
use tandem_core::condition::TYPE_AGENT_SYNCED;
use tandem_core::{Applicator, ObjectKey, ObjectStore, StoreError};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Finalizer the claim reconciler places on local objects.
pub const DEFAULT_FINALIZER: &str = "agent.tandem.dev/claim";

/// Guards local deletion until the remote counterpart is gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn add_finalizer(&self, obj: &mut DynamicObject) -> Result<(), StoreError>;
    async fn remove_finalizer(&self, obj: &mut DynamicObject) -> Result<(), StoreError>;
}

/// Pushes the desired state of `local` to the remote cluster and reflects the
/// observed remote state back onto `local`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Propagator: Send + Sync {
    async fn propagate(&self, local: &mut DynamicObject, remote: &DynamicObject) -> Result<(), StoreError>;
}

/// Knows how to enumerate one kind and mint empty instances of it.
pub trait InstanceSet: Send + Sync {
    fn resource(&self) -> &ApiResource;
    /// Selection used for list calls.
    fn new_list(&self) -> ListParams;
    /// Members of a listed collection.
    fn items(&self, listed: Vec<DynamicObject>) -> Vec<DynamicObject>;
    /// Empty instance carrying only the identity of `key`.
    fn new_instance(&self, key: &ObjectKey) -> DynamicObject;
}

/// [`Finalizer`] that writes the finalizer list through an [`ObjectStore`].
/// Both operations are no-ops when the object is already in the wanted state.
pub struct ApiFinalizer {
    store: Arc<dyn ObjectStore>,
    resource: ApiResource,
    name: String,
}

impl ApiFinalizer {
    pub fn new(store: Arc<dyn ObjectStore>, resource: ApiResource, name: impl Into<String>) -> Self {
        Self { store, resource, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Finalizer for ApiFinalizer {
    async fn add_finalizer(&self, obj: &mut DynamicObject) -> Result<(), StoreError> {
        if obj.finalizers().iter().any(|f| f == &self.name) {
            return Ok(());
        }
        let mut desired = obj.clone();
        desired.finalizers_mut().push(self.name.clone());
        *obj = self.store.update(&self.resource, &desired).await?;
        debug!(finalizer = %self.name, name = %obj.name_any(), "finalizer added");
        Ok(())
    }

    async fn remove_finalizer(&self, obj: &mut DynamicObject) -> Result<(), StoreError> {
        if !obj.finalizers().iter().any(|f| f == &self.name) {
            return Ok(());
        }
        let mut desired = obj.clone();
        desired.finalizers_mut().retain(|f| f != &self.name);
        *obj = self.store.update(&self.resource, &desired).await?;
        debug!(finalizer = %self.name, name = %obj.name_any(), "finalizer removed");
        Ok(())
    }
}

/// [`Propagator`] that applies a cluster-neutral copy of the local spec to the
/// remote cluster and mirrors the applied object's status back.
pub struct ApplyPropagator {
    applicator: Arc<dyn Applicator>,
    resource: ApiResource,
}

impl ApplyPropagator {
    pub fn new(applicator: Arc<dyn Applicator>, resource: ApiResource) -> Self {
        Self { applicator, resource }
    }
}

#[async_trait]
impl Propagator for ApplyPropagator {
    async fn propagate(&self, local: &mut DynamicObject, remote: &DynamicObject) -> Result<(), StoreError> {
        let mut desired = sanitize(local);
        strip_status(&mut desired);
        desired.metadata.name = remote.metadata.name.clone().or(desired.metadata.name);
        desired.metadata.namespace = remote.metadata.namespace.clone().or(desired.metadata.namespace);
        let creating = remote.metadata.resource_version.is_none();
        let applied = self.applicator.apply(&self.resource, &desired).await?;
        info!(name = %applied.name_any(), creating, "desired state propagated");
        mirror_status(local, applied.data.get("status").cloned());
        Ok(())
    }
}

/// Replace the local status with `remote_status`, keeping the local sync
/// condition. A missing remote status leaves the local one alone.
pub fn mirror_status(local: &mut DynamicObject, remote_status: Option<Json>) {
    let Some(mut status) = remote_status else { return };
    let Some(fields) = status.as_object_mut() else { return };
    let is_sync = |c: &Json| c.get("type").and_then(Json::as_str) == Some(TYPE_AGENT_SYNCED);
    let own: Vec<Json> = local
        .data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(Json::as_array)
        .map(|cs| cs.iter().filter(|c| is_sync(c)).cloned().collect())
        .unwrap_or_default();
    let mut conditions: Vec<Json> = fields
        .get("conditions")
        .and_then(Json::as_array)
        .map(|cs| cs.iter().filter(|c| !is_sync(c)).cloned().collect())
        .unwrap_or_default();
    conditions.extend(own);
    if !conditions.is_empty() {
        fields.insert("conditions".into(), Json::Array(conditions));
    }
    if !local.data.is_object() {
        local.data = Json::Object(serde_json::Map::new());
    }
    if let Some(data) = local.data.as_object_mut() {
        data.insert("status".into(), status);
    }
}

/// [`InstanceSet`] over an arbitrary kind, listed across all namespaces.
#[derive(Debug, Clone)]
pub struct DynamicInstanceSet {
    resource: ApiResource,
}

impl DynamicInstanceSet {
    pub fn new(resource: ApiResource) -> Self {
        Self { resource }
    }
}

impl InstanceSet for DynamicInstanceSet {
    fn resource(&self) -> &ApiResource {
        &self.resource
    }

    fn new_list(&self) -> ListParams {
        ListParams::default()
    }

    fn items(&self, listed: Vec<DynamicObject>) -> Vec<DynamicObject> {
        listed.into_iter().filter(|o| o.metadata.name.is_some()).collect()
    }

    fn new_instance(&self, key: &ObjectKey) -> DynamicObject {
        let obj = DynamicObject::new(&key.name, &self.resource);
        match &key.namespace {
            Some(ns) => obj.within(ns),
            None => obj,
        }
    }
}
