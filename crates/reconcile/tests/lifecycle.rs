//! End-to-end passes of both reconcilers against in-memory clusters, using the
//! default finalizer, propagator and instance-set strategies.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tandem_core::condition::{condition, TYPE_AGENT_SYNCED};
use tandem_core::{Applicator, ClientApplicator, ConditionStatus, ObjectKey, ObjectStore, StoreError, WaitTiers};
use tandem_reconcile::{
    crd_resource, ClaimReconciler, DynamicInstanceSet, ExtensionReconciler, DEFAULT_FINALIZER, DELETION_REQUESTED,
};

type Slot = (String, Option<String>, String);

/// Tiny API server: objects keyed by kind/namespace/name, finalizer-aware deletes.
#[derive(Default)]
struct Cluster {
    objects: Mutex<BTreeMap<Slot, DynamicObject>>,
    revision: Mutex<u64>,
}

impl Cluster {
    fn slot(ar: &ApiResource, ns: Option<String>, name: &str) -> Slot {
        (ar.kind.clone(), ns, name.to_string())
    }

    fn bump(&self, obj: &mut DynamicObject) {
        let mut rv = self.revision.lock().unwrap();
        *rv += 1;
        obj.metadata.resource_version = Some(rv.to_string());
    }

    fn seed(&self, ar: &ApiResource, mut obj: DynamicObject) {
        self.bump(&mut obj);
        let slot = Self::slot(ar, obj.namespace(), &obj.name_any());
        self.objects.lock().unwrap().insert(slot, obj);
    }

    fn peek(&self, ar: &ApiResource, key: &ObjectKey) -> Option<DynamicObject> {
        self.objects.lock().unwrap().get(&Self::slot(ar, key.namespace.clone(), &key.name)).cloned()
    }

    fn names(&self, ar: &ApiResource) -> Vec<String> {
        self.objects.lock().unwrap().keys().filter(|(k, _, _)| k == &ar.kind).map(|(_, _, n)| n.clone()).collect()
    }
}

#[async_trait]
impl ObjectStore for Cluster {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        self.peek(ar, key).ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let slot = Self::slot(ar, obj.namespace(), &obj.name_any());
        let mut next = obj.clone();
        self.bump(&mut next);
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(&slot) {
            return Err(StoreError::NotFound(obj.name_any()));
        }
        if next.metadata.deletion_timestamp.is_some() && next.finalizers().is_empty() {
            objects.remove(&slot);
        } else {
            objects.insert(slot, next.clone());
        }
        Ok(next)
    }

    async fn update_status(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<(), StoreError> {
        let slot = Self::slot(ar, obj.namespace(), &obj.name_any());
        let mut objects = self.objects.lock().unwrap();
        let stored = objects.get_mut(&slot).ok_or_else(|| StoreError::NotFound(obj.name_any()))?;
        stored.data["status"] = obj.data.get("status").cloned().unwrap_or_else(|| json!({}));
        Ok(())
    }

    async fn delete(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<(), StoreError> {
        let slot = Self::slot(ar, obj.namespace(), &obj.name_any());
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&slot) {
            Some(stored) if !stored.finalizers().is_empty() => {
                stored.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
            }
            Some(_) => {
                objects.remove(&slot);
            }
            None => {}
        }
        Ok(())
    }

    async fn list(&self, ar: &ApiResource, _params: &ListParams) -> Result<Vec<DynamicObject>, StoreError> {
        Ok(self.objects.lock().unwrap().iter().filter(|((k, _, _), _)| k == &ar.kind).map(|(_, o)| o.clone()).collect())
    }
}

#[async_trait]
impl Applicator for Cluster {
    async fn apply(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let slot = Self::slot(ar, obj.namespace(), &obj.name_any());
        let mut next = obj.clone();
        self.bump(&mut next);
        let mut objects = self.objects.lock().unwrap();
        if let Some(status) = objects.get(&slot).and_then(|o| o.data.get("status")).cloned() {
            next.data["status"] = status;
        }
        objects.insert(slot, next.clone());
        Ok(next)
    }
}

fn waits() -> WaitTiers {
    WaitTiers::from_secs(1, 10, 100).unwrap()
}

fn bucket() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("example.org", "v1alpha1", "Bucket"))
}

fn client_applicator(c: &Arc<Cluster>) -> ClientApplicator {
    ClientApplicator::new(c.clone(), c.clone())
}

#[tokio::test]
async fn claim_sync_and_deletion_protocol() {
    let local = Arc::new(Cluster::default());
    let remote = Arc::new(Cluster::default());
    let ar = bucket();
    let key = ObjectKey::namespaced("b", "team-a");
    local.seed(&ar, DynamicObject::new("b", &ar).within("team-a").data(json!({ "spec": { "size": 3 } })));

    let r = ClaimReconciler::builder(local.clone(), client_applicator(&remote), ar.clone()).waits(waits()).build();

    // first pass: finalizer placed, remote created, success recorded
    assert_eq!(r.reconcile(&key).await.unwrap(), Action::requeue(Duration::from_secs(100)));
    let l = local.peek(&ar, &key).unwrap();
    assert_eq!(l.finalizers(), [DEFAULT_FINALIZER.to_string()]);
    let synced = condition(&l, TYPE_AGENT_SYNCED).unwrap();
    assert_eq!(synced.status, ConditionStatus::True);
    let rem = remote.peek(&ar, &key).unwrap();
    assert_eq!(rem.data["spec"]["size"], 3);
    assert!(rem.finalizers().is_empty());

    // remote status is mirrored back on the next pass
    {
        let mut objs = remote.objects.lock().unwrap();
        let stored = objs.values_mut().next().unwrap();
        stored.data["status"] = json!({ "phase": "Ready" });
    }
    assert_eq!(r.reconcile(&key).await.unwrap(), Action::requeue(Duration::from_secs(100)));
    let l = local.peek(&ar, &key).unwrap();
    assert_eq!(l.data["status"]["phase"], "Ready");
    assert!(condition(&l, TYPE_AGENT_SYNCED).is_some());

    // local delete is held by the finalizer; remote deletion is requested
    local.delete(&ar, &l).await.unwrap();
    assert_eq!(r.reconcile(&key).await.unwrap(), Action::requeue(Duration::from_secs(1)));
    assert!(remote.peek(&ar, &key).is_none());
    let l = local.peek(&ar, &key).unwrap();
    assert_eq!(condition(&l, TYPE_AGENT_SYNCED).unwrap().message, DELETION_REQUESTED);

    // remote gone: finalizer released, local object disappears
    assert_eq!(r.reconcile(&key).await.unwrap(), Action::await_change());
    assert!(local.peek(&ar, &key).is_none());
    assert_eq!(r.reconcile(&key).await.unwrap(), Action::await_change());
}

#[tokio::test]
async fn extension_upserts_requested_and_collects_stale() {
    let local = Arc::new(Cluster::default());
    let remote = Arc::new(Cluster::default());
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apiextensions.crossplane.io", "v1", "Composition"));
    let crd_name = "compositions.apiextensions.crossplane.io";

    local.seed(
        &crd_resource(),
        DynamicObject::new(crd_name, &crd_resource())
            .data(json!({ "status": { "conditions": [{ "type": "Established", "status": "True" }] } })),
    );
    for name in ["one", "two"] {
        remote.seed(&ar, DynamicObject::new(name, &ar).data(json!({ "spec": { "owner": name } })));
    }
    for name in ["one", "stale"] {
        local.seed(&ar, DynamicObject::new(name, &ar).data(json!({ "spec": { "owner": "old" } })));
    }

    let r = ExtensionReconciler::new(
        client_applicator(&local),
        remote.clone(),
        Arc::new(DynamicInstanceSet::new(ar.clone())),
        crd_name,
        waits(),
    );

    assert_eq!(r.reconcile(&ObjectKey::cluster("two")).await.unwrap(), Action::requeue(Duration::from_secs(100)));
    assert_eq!(local.names(&ar), vec!["one".to_string(), "two".to_string()]);
    let two = local.peek(&ar, &ObjectKey::cluster("two")).unwrap();
    assert_eq!(two.data["spec"]["owner"], "two");
    // only the requested instance is content-synced
    let one = local.peek(&ar, &ObjectKey::cluster("one")).unwrap();
    assert_eq!(one.data["spec"]["owner"], "old");

    // a second pass changes nothing
    assert_eq!(r.reconcile(&ObjectKey::cluster("two")).await.unwrap(), Action::requeue(Duration::from_secs(100)));
    assert_eq!(local.names(&ar), vec!["one".to_string(), "two".to_string()]);

    // remote emptied: no watch event remains, the periodic sweep clears the copies
    for name in ["one", "two"] {
        let obj = remote.peek(&ar, &ObjectKey::cluster(name)).unwrap();
        remote.delete(&ar, &obj).await.unwrap();
    }
    assert_eq!(r.sweep().await.unwrap(), 2);
    assert!(local.names(&ar).is_empty());
    assert_eq!(r.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn extension_waits_for_crd() {
    let local = Arc::new(Cluster::default());
    let remote = Arc::new(Cluster::default());
    let ar = bucket();
    let r = ExtensionReconciler::new(
        client_applicator(&local),
        remote.clone(),
        Arc::new(DynamicInstanceSet::new(ar)),
        "buckets.example.org",
        waits(),
    );
    // missing CRD is an error, a pending one a tiny requeue
    assert!(r.reconcile(&ObjectKey::cluster("x")).await.is_err());
    local.seed(&crd_resource(), DynamicObject::new("buckets.example.org", &crd_resource()).data(json!({})));
    assert_eq!(r.reconcile(&ObjectKey::cluster("x")).await.unwrap(), Action::requeue(Duration::from_secs(1)));
}
