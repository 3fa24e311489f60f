//! [`ObjectStore`] over a live cluster, one `Api<DynamicObject>` per call.

use async_trait::async_trait;
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;
use tandem_core::{ObjectKey, ObjectStore, StoreError};
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn api_for(&self, ar: &ApiResource, obj: &DynamicObject) -> Api<DynamicObject> {
        self.api(ar, obj.metadata.namespace.as_deref())
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    #[instrument(level = "debug", skip_all, fields(kind = %resource.kind, key = %key))]
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        let obj = self.api(resource, key.namespace.as_deref()).get(&key.name).await?;
        Ok(obj)
    }

    #[instrument(level = "debug", skip_all, fields(kind = %resource.kind, name = %obj.name_any()))]
    async fn update(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let updated = self.api_for(resource, obj).replace(&obj.name_any(), &PostParams::default(), obj).await?;
        debug!(rv = ?updated.metadata.resource_version, "object replaced");
        Ok(updated)
    }

    #[instrument(level = "debug", skip_all, fields(kind = %resource.kind, name = %obj.name_any()))]
    async fn update_status(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<(), StoreError> {
        let status = obj.data.get("status").cloned().unwrap_or_else(|| json!({}));
        let patch = json!({ "status": status });
        self.api_for(resource, obj)
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(kind = %resource.kind, name = %obj.name_any()))]
    async fn delete(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<(), StoreError> {
        match self.api_for(resource, obj).delete(&obj.name_any(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(level = "debug", skip_all, fields(kind = %resource.kind))]
    async fn list(&self, resource: &ApiResource, params: &ListParams) -> Result<Vec<DynamicObject>, StoreError> {
        let list = self.api(resource, None).list(params).await?;
        debug!(count = list.items.len(), "listed");
        Ok(list.items)
    }
}
