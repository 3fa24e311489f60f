//! Tandem reconcilers. Both loops are stateless between calls and talk to the
//! two clusters only through the `tandem-core` store contracts.

#![forbid(unsafe_code)]

pub mod claim;
pub mod controller;
pub mod extension;
pub mod strategy;

pub use claim::{ClaimReconciler, ClaimReconcilerBuilder, DELETION_REQUESTED};
pub use controller::{run, Reconciler};
pub use extension::{crd_resource, is_established, ExtensionReconciler};
pub use strategy::{
    ApiFinalizer, ApplyPropagator, DynamicInstanceSet, Finalizer, InstanceSet, Propagator, DEFAULT_FINALIZER,
};
