//! Tandem apply: server-side apply of dynamic objects and the metadata
//! scrubbing needed before an object is copied to another cluster.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::{
    api::{Api, ApiResource, DynamicObject, Patch, PatchParams},
    core::TypeMeta,
    Client, ResourceExt,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tandem_core::{Applicator, StoreError};
use tracing::{debug, instrument, warn};

pub const DEFAULT_FIELD_MANAGER: &str = "tandem";

pub const METRIC_APPLY_OK: &str = "tandem_apply_ok_total";
pub const METRIC_APPLY_ERR: &str = "tandem_apply_err_total";
pub const METRIC_APPLY_LATENCY: &str = "tandem_apply_latency_ms";

/// Deep copy of `obj` with the cluster-assigned metadata removed, so the result
/// can be written to a different cluster (or re-applied) without conflicts.
pub fn sanitize(obj: &DynamicObject) -> DynamicObject {
    let mut out = obj.clone();
    let meta = &mut out.metadata;
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.self_link = None;
    meta.owner_references = None;
    meta.managed_fields = None;
    meta.finalizers = None;
    meta.generation = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    out
}

/// Remove the server-populated `status` from the object body.
pub fn strip_status(obj: &mut DynamicObject) -> Option<Json> {
    obj.data.as_object_mut().and_then(|o| o.remove("status"))
}

/// [`Applicator`] backed by server-side apply, forcing ownership of the fields
/// it sends.
#[derive(Clone)]
pub struct SsaApplicator {
    client: Client,
    field_manager: String,
}

impl SsaApplicator {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }
}

/// Apply payload: typed, without managed fields or a resourceVersion precondition.
fn apply_payload(resource: &ApiResource, obj: &DynamicObject) -> DynamicObject {
    let mut payload = obj.clone();
    payload.types = Some(TypeMeta { api_version: resource.api_version.clone(), kind: resource.kind.clone() });
    payload.metadata.managed_fields = None;
    payload.metadata.resource_version = None;
    payload
}

#[async_trait]
impl Applicator for SsaApplicator {
    #[instrument(level = "debug", skip_all, fields(kind = %resource.kind, name = %obj.name_any(), ns = ?obj.namespace()))]
    async fn apply(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let t0 = std::time::Instant::now();
        let name = obj.name_any();
        if name.is_empty() {
            counter!(METRIC_APPLY_ERR, 1u64);
            return Err(StoreError::Backend(format!("cannot apply unnamed {}", resource.kind)));
        }
        let api: Api<DynamicObject> = match obj.namespace() {
            Some(ns) => Api::namespaced_with(self.client.clone(), &ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        };
        let pp = PatchParams::apply(&self.field_manager).force();
        let payload = apply_payload(resource, obj);
        match api.patch(&name, &pp, &Patch::Apply(&payload)).await {
            Ok(applied) => {
                histogram!(METRIC_APPLY_LATENCY, t0.elapsed().as_secs_f64() * 1000.0);
                counter!(METRIC_APPLY_OK, 1u64);
                debug!(rv = ?applied.metadata.resource_version, "server-side apply ok");
                Ok(applied)
            }
            Err(e) => {
                counter!(METRIC_APPLY_ERR, 1u64);
                warn!(error = %e, "server-side apply failed");
                Err(e.into())
            }
        }
    }
}
