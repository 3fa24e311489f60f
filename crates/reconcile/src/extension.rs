//! Extension reconciler: once a CRD is established locally, copies the
//! requested instance of that kind from remote to local and removes local
//! instances that no longer exist remotely.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use metrics::counter;
use serde_json::Value as Json;
use tandem_apply::{sanitize, strip_status};
use tandem_core::{ClientApplicator, ObjectKey, ObjectStore, ReconcileError, WaitTiers};
use tracing::{debug, info, instrument, warn};

use crate::controller::Reconciler;
use crate::strategy::InstanceSet;

/// Resource descriptor for reading CRDs through the dynamic store.
pub fn crd_resource() -> ApiResource {
    ApiResource::erase::<CustomResourceDefinition>(&())
}

/// True iff the CRD reports `Established=True`.
pub fn is_established(crd: &DynamicObject) -> bool {
    crd.data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(Json::as_array)
        .map(|cs| {
            cs.iter().any(|c| {
                c.get("type").and_then(Json::as_str) == Some("Established")
                    && c.get("status").and_then(Json::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

pub struct ExtensionReconciler {
    local: ClientApplicator,
    remote: Arc<dyn ObjectStore>,
    instances: Arc<dyn InstanceSet>,
    crd_name: String,
    crd_resource: ApiResource,
    waits: WaitTiers,
}

impl ExtensionReconciler {
    pub fn new(
        local: ClientApplicator,
        remote: Arc<dyn ObjectStore>,
        instances: Arc<dyn InstanceSet>,
        crd_name: impl Into<String>,
        waits: WaitTiers,
    ) -> Self {
        Self { local, remote, instances, crd_name: crd_name.into(), crd_resource: crd_resource(), waits }
    }

    pub fn crd_name(&self) -> &str {
        &self.crd_name
    }

    #[instrument(skip_all, fields(crd = %self.crd_name, key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let crd = &self.crd_name;
        let resource = self.instances.resource();

        if !self.established().await? {
            debug!(requeue = ?self.waits.tiny, "crd not established yet");
            return Ok(Action::requeue(self.waits.tiny));
        }

        match self.remote.get(resource, key).await {
            Ok(remote) => {
                let desired = self.desired_local(key, &remote);
                self.local
                    .applicator
                    .apply(resource, &desired)
                    .await
                    .map_err(|e| ReconcileError::local(format!("apply instance of {} failed", crd), e))?;
                debug!("instance applied locally");
            }
            Err(e) if e.is_not_found() => debug!("instance gone remotely, skipping apply"),
            Err(e) => return Err(ReconcileError::remote(format!("get instance of {} failed", crd), e)),
        }

        self.collect_garbage().await?;
        Ok(Action::requeue(self.waits.long))
    }

    /// Garbage collection without a triggering instance. Watch events only
    /// arrive while the remote cluster still holds instances, so this is what
    /// removes the last local copies once the remote side is empty.
    #[instrument(skip_all, fields(crd = %self.crd_name))]
    pub async fn sweep(&self) -> Result<usize, ReconcileError> {
        if !self.established().await? {
            debug!("crd not established yet, nothing to sweep");
            return Ok(0);
        }
        self.collect_garbage().await
    }

    async fn established(&self) -> Result<bool, ReconcileError> {
        let crd = &self.crd_name;
        let schema = self
            .local
            .client
            .get(&self.crd_resource, &ObjectKey::cluster(crd))
            .await
            .map_err(|e| ReconcileError::local(format!("get crd {} failed", crd), e))?;
        Ok(is_established(&schema))
    }

    /// Delete local instances whose name is absent remotely. Stops at the
    /// first failed delete.
    async fn collect_garbage(&self) -> Result<usize, ReconcileError> {
        let crd = &self.crd_name;
        let resource = self.instances.resource();
        let params = self.instances.new_list();
        let local_items = self
            .local
            .client
            .list(resource, &params)
            .await
            .map(|l| self.instances.items(l))
            .map_err(|e| ReconcileError::local(format!("list instances of {} failed", crd), e))?;
        let remote_items = self
            .remote
            .list(resource, &params)
            .await
            .map(|l| self.instances.items(l))
            .map_err(|e| ReconcileError::remote(format!("list instances of {} failed", crd), e))?;

        let remote_names: HashSet<String> = remote_items.iter().map(|o| o.name_any()).collect();
        let mut deleted = 0;
        for stale in local_items.iter().filter(|o| !remote_names.contains(&o.name_any())) {
            self.local
                .client
                .delete(resource, stale)
                .await
                .map_err(|e| ReconcileError::local(format!("delete instance of {} failed", crd), e))?;
            counter!("tandem_gc_deleted_total", 1u64, "crd" => crd.clone());
            info!(name = %stale.name_any(), ns = ?stale.namespace(), "deleted local instance missing remotely");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Local shell for `key` filled with the remote labels, annotations and body.
    fn desired_local(&self, key: &ObjectKey, remote: &DynamicObject) -> DynamicObject {
        let mut clean = sanitize(remote);
        strip_status(&mut clean);
        let mut desired = self.instances.new_instance(key);
        desired.metadata.labels = clean.metadata.labels;
        desired.metadata.annotations = clean.metadata.annotations;
        desired.data = clean.data;
        desired
    }
}

#[async_trait]
impl Reconciler for ExtensionReconciler {
    fn name(&self) -> &'static str {
        "extension"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        ExtensionReconciler::reconcile(self, key).await
    }

    fn error_policy(&self, err: &ReconcileError) -> Action {
        warn!(crd = %self.crd_name, error = %err, "extension reconcile error");
        Action::requeue(self.waits.short)
    }

    async fn resync(&self) -> Result<(), ReconcileError> {
        self.sweep().await.map(|_| ())
    }
}
