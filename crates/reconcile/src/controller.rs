//! Runs a [`Reconciler`] under the kube controller runtime: watch events become
//! reconcile requests, returned [`Action`]s become requeues.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{future, stream, Stream, StreamExt};
use kube::api::{Api, ApiResource, DynamicObject};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use metrics::{counter, histogram};
use tandem_core::{ObjectKey, ReconcileError};
use tracing::{debug, error, info, warn};

/// A level-triggered reconcile loop body.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;

    /// Requeue decision for an error returned by [`Reconciler::reconcile`].
    fn error_policy(&self, err: &ReconcileError) -> Action;

    /// Periodic pass that does not depend on any watched object existing.
    async fn resync(&self) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Outcome label for `tandem_reconcile_total`.
pub fn outcome(result: &Result<Action, ReconcileError>) -> &'static str {
    match result {
        Ok(action) if *action == Action::await_change() => "done",
        Ok(_) => "requeue",
        Err(_) => "error",
    }
}

async fn reconcile_object<R: Reconciler>(obj: Arc<DynamicObject>, reconciler: Arc<R>) -> Result<Action, ReconcileError> {
    let key = ObjectKey::from(obj.as_ref());
    let t0 = Instant::now();
    let result = reconciler.reconcile(&key).await;
    let name = reconciler.name();
    histogram!("tandem_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "controller" => name);
    counter!("tandem_reconcile_total", 1u64, "controller" => name, "outcome" => outcome(&result));
    result
}

fn error_policy<R: Reconciler>(_obj: Arc<DynamicObject>, err: &ReconcileError, reconciler: Arc<R>) -> Action {
    reconciler.error_policy(err)
}

/// One tick per `period`, the first after a full period.
pub fn resync_ticks(period: Duration) -> impl Stream<Item = ()> + Send {
    stream::unfold((), move |()| async move {
        tokio::time::sleep(period).await;
        Some(((), ()))
    })
}

async fn resync_loop<R: Reconciler>(period: Duration, reconciler: Arc<R>) {
    let name = reconciler.name();
    resync_ticks(period)
        .for_each(|()| {
            let reconciler = reconciler.clone();
            async move {
                let result = reconciler.resync().await;
                let label = if result.is_ok() { "done" } else { "error" };
                counter!("tandem_resync_total", 1u64, "controller" => name, "outcome" => label);
                match result {
                    Ok(()) => debug!(controller = name, "resync pass done"),
                    Err(e) => warn!(controller = name, error = %e, "resync pass failed"),
                }
            }
        })
        .await;
}

/// Watch `api` (objects of `resource`) and drive `reconciler` until SIGINT/SIGTERM.
/// With `resync` set, [`Reconciler::resync`] also runs on that period for as
/// long as the watch does.
pub async fn run<R: Reconciler>(
    api: Api<DynamicObject>,
    resource: ApiResource,
    reconciler: Arc<R>,
    resync: Option<Duration>,
) {
    let name = reconciler.name();
    info!(controller = name, kind = %resource.kind, ?resync, "starting controller");
    let watch = Controller::new_with(api, watcher::Config::default(), resource)
        .shutdown_on_signal()
        .run(reconcile_object::<R>, error_policy::<R>, reconciler.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(controller = name, object = %obj.name, ?action, "reconciled"),
                Err(e) => error!(controller = name, error = %e, "reconcile failed"),
            }
        });
    match resync {
        Some(period) => {
            let sweep = resync_loop(period, reconciler);
            future::select(Box::pin(watch), Box::pin(sweep)).await;
        }
        None => watch.await,
    }
    info!(controller = name, "controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use kube::core::GroupVersionKind;
    use tandem_core::StoreError;

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Reconciler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(key, &ObjectKey::namespaced("b", "team-a"));
            if self.fail {
                Err(ReconcileError::remote("get instance failed", StoreError::Backend("boom".into())))
            } else {
                Ok(Action::requeue(Duration::from_secs(60)))
            }
        }

        fn error_policy(&self, _err: &ReconcileError) -> Action {
            Action::requeue(Duration::from_secs(30))
        }
    }

    fn obj() -> Arc<DynamicObject> {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("example.org", "v1alpha1", "Bucket"));
        Arc::new(DynamicObject::new("b", &ar).within("team-a"))
    }

    #[tokio::test]
    async fn object_key_is_derived_from_watched_object() {
        let r = Arc::new(Counting { calls: AtomicUsize::new(0), fail: false });
        let action = reconcile_object(obj(), r.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_go_through_reconciler_policy() {
        let r = Arc::new(Counting { calls: AtomicUsize::new(0), fail: true });
        let err = reconcile_object(obj(), r.clone()).await.unwrap_err();
        assert_eq!(error_policy(obj(), &err, r), Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome(&Ok(Action::await_change())), "done");
        assert_eq!(outcome(&Ok(Action::requeue(Duration::from_secs(1)))), "requeue");
        let err = ReconcileError::local("get instance failed", StoreError::Backend("x".into()));
        assert_eq!(outcome(&Err(err)), "error");
    }

    #[tokio::test]
    async fn default_resync_is_a_no_op() {
        let r = Counting { calls: AtomicUsize::new(0), fail: true };
        assert!(r.resync().await.is_ok());
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resync_ticks_keep_coming() {
        let ticks: Vec<()> = resync_ticks(Duration::from_millis(5)).take(3).collect().await;
        assert_eq!(ticks.len(), 3);
    }

    struct Sweeping {
        sweeps: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for Sweeping {
        fn name(&self) -> &'static str {
            "sweeping"
        }

        async fn reconcile(&self, _key: &ObjectKey) -> Result<Action, ReconcileError> {
            Ok(Action::await_change())
        }

        fn error_policy(&self, _err: &ReconcileError) -> Action {
            Action::await_change()
        }

        async fn resync(&self) -> Result<(), ReconcileError> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Err(ReconcileError::local("list instances failed", StoreError::Backend("boom".into())))
        }
    }

    #[tokio::test]
    async fn resync_loop_survives_failed_passes() {
        let r = Arc::new(Sweeping { sweeps: AtomicUsize::new(0) });
        let _ = tokio::time::timeout(Duration::from_millis(200), resync_loop(Duration::from_millis(10), r.clone())).await;
        assert!(r.sweeps.load(Ordering::SeqCst) >= 2);
    }
}
