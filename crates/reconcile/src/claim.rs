//! Claim reconciler: keeps a remote counterpart of a local claim in sync and
//! guards local deletion until the remote object is gone.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tandem_core::condition::set_condition;
use tandem_core::{ClientApplicator, Condition, ObjectKey, ObjectStore, ReconcileError, WaitTiers};
use tracing::{debug, info, instrument, warn};

use crate::controller::Reconciler;
use crate::strategy::{ApiFinalizer, ApplyPropagator, Finalizer, Propagator, DEFAULT_FINALIZER};

/// Message of the success condition written once remote deletion is requested.
pub const DELETION_REQUESTED: &str = "deletion is successfully requested";

pub struct ClaimReconciler {
    local: Arc<dyn ObjectStore>,
    remote: ClientApplicator,
    resource: ApiResource,
    finalizer: Arc<dyn Finalizer>,
    propagator: Arc<dyn Propagator>,
    waits: WaitTiers,
}

pub struct ClaimReconcilerBuilder {
    local: Arc<dyn ObjectStore>,
    remote: ClientApplicator,
    resource: ApiResource,
    finalizer: Option<Arc<dyn Finalizer>>,
    propagator: Option<Arc<dyn Propagator>>,
    waits: WaitTiers,
}

impl ClaimReconcilerBuilder {
    pub fn finalizer(mut self, finalizer: Arc<dyn Finalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn propagator(mut self, propagator: Arc<dyn Propagator>) -> Self {
        self.propagator = Some(propagator);
        self
    }

    pub fn waits(mut self, waits: WaitTiers) -> Self {
        self.waits = waits;
        self
    }

    pub fn build(self) -> ClaimReconciler {
        let finalizer = self.finalizer.unwrap_or_else(|| {
            Arc::new(ApiFinalizer::new(self.local.clone(), self.resource.clone(), DEFAULT_FINALIZER)) as Arc<dyn Finalizer>
        });
        let propagator = self
            .propagator
            .unwrap_or_else(|| Arc::new(ApplyPropagator::new(self.remote.applicator.clone(), self.resource.clone())) as Arc<dyn Propagator>);
        ClaimReconciler {
            local: self.local,
            remote: self.remote,
            resource: self.resource,
            finalizer,
            propagator,
            waits: self.waits,
        }
    }
}

impl ClaimReconciler {
    /// Defaults: [`ApiFinalizer`] with [`DEFAULT_FINALIZER`] on the local store,
    /// [`ApplyPropagator`] on the remote applicator, default wait tiers.
    pub fn builder(local: Arc<dyn ObjectStore>, remote: ClientApplicator, resource: ApiResource) -> ClaimReconcilerBuilder {
        ClaimReconcilerBuilder { local, remote, resource, finalizer: None, propagator: None, waits: WaitTiers::default() }
    }

    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    #[instrument(skip_all, fields(kind = %self.resource.kind, key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let mut local = match self.local.get(&self.resource, key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!("local instance is gone");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(ReconcileError::local("get instance failed", e)),
        };

        if local.metadata.deletion_timestamp.is_some() {
            return self.reconcile_deletion(key, local).await;
        }

        if let Err(e) = self.finalizer.add_finalizer(&mut local).await {
            return self.fail(&mut local, ReconcileError::local("add finalizer failed", e)).await;
        }

        let remote = match self.remote.client.get(&self.resource, key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => self.empty_remote(&local),
            Err(e) => return self.fail(&mut local, ReconcileError::remote("get instance failed", e)).await,
        };

        if let Err(e) = self.propagator.propagate(&mut local, &remote).await {
            return self.fail(&mut local, ReconcileError::propagation("propagate desired state failed", e)).await;
        }

        set_condition(&mut local, Condition::agent_sync_success());
        self.write_status(&local).await?;
        debug!(requeue = ?self.waits.long, "claim in sync");
        Ok(Action::requeue(self.waits.long))
    }

    async fn reconcile_deletion(&self, key: &ObjectKey, mut local: DynamicObject) -> Result<Action, ReconcileError> {
        match self.remote.client.get(&self.resource, key).await {
            Err(e) if e.is_not_found() => {
                if let Err(e) = self.finalizer.remove_finalizer(&mut local).await {
                    return self.fail(&mut local, ReconcileError::local("remove finalizer failed", e)).await;
                }
                info!("remote counterpart gone, local deletion released");
                Ok(Action::await_change())
            }
            Err(e) => self.fail(&mut local, ReconcileError::remote("get instance failed", e)).await,
            Ok(remote) => {
                if let Err(e) = self.remote.client.delete(&self.resource, &remote).await {
                    return self.fail(&mut local, ReconcileError::remote("delete instance failed", e)).await;
                }
                info!(remote = %remote.name_any(), "remote deletion requested");
                set_condition(&mut local, Condition::agent_sync_success().with_message(DELETION_REQUESTED));
                self.write_status(&local).await?;
                Ok(Action::requeue(self.waits.tiny))
            }
        }
    }

    /// Empty remote instance carrying the local identity.
    fn empty_remote(&self, local: &DynamicObject) -> DynamicObject {
        let obj = DynamicObject::new(&local.name_any(), &self.resource);
        match local.namespace() {
            Some(ns) => obj.within(&ns),
            None => obj,
        }
    }

    /// Record `err` on the local status and back off.
    async fn fail(&self, local: &mut DynamicObject, err: ReconcileError) -> Result<Action, ReconcileError> {
        warn!(error = %err, "claim sync failed");
        set_condition(local, Condition::agent_sync_error(&err));
        self.write_status(local).await?;
        Ok(Action::requeue(self.waits.short))
    }

    async fn write_status(&self, local: &DynamicObject) -> Result<(), ReconcileError> {
        self.local
            .update_status(&self.resource, local)
            .await
            .map_err(|e| ReconcileError::local("update status failed", e))
    }
}

#[async_trait]
impl Reconciler for ClaimReconciler {
    fn name(&self) -> &'static str {
        "claim"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        ClaimReconciler::reconcile(self, key).await
    }

    fn error_policy(&self, err: &ReconcileError) -> Action {
        warn!(kind = %self.resource.kind, error = %err, "claim reconcile error");
        Action::requeue(self.waits.short)
    }
}
