//! Tandem core types: wait tiers, sync conditions, errors and the store contracts
//! both reconcilers are written against.

#![forbid(unsafe_code)]

pub mod condition;
pub mod error;
pub mod store;
pub mod wait;

pub use condition::{Condition, ConditionStatus};
pub use error::{ConfigError, Origin, ReconcileError, StoreError};
pub use store::{Applicator, ClientApplicator, ObjectKey, ObjectStore};
pub use wait::WaitTiers;

#[cfg(any(test, feature = "mock"))]
pub use store::{MockApplicator, MockObjectStore};
