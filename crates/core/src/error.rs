//! Error taxonomy shared by the reconcilers and their collaborators.

use thiserror::Error;

/// Which cluster (or stage) produced an error. Rendered as the message prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
    Propagation,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Propagation => write!(f, "propagation"),
        }
    }
}

/// Failure of a single object-store call.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist. Never surfaced as a reconcile error.
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Kube(kube::Error),

    /// Anything else a store implementation wants to report verbatim.
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message),
            other => Self::Kube(other),
        }
    }
}

/// A reconcile-step failure tagged with its origin, e.g.
/// `remote: get instance failed: boom`.
#[derive(Debug, Error)]
#[error("{origin}: {context}: {source}")]
pub struct ReconcileError {
    pub origin: Origin,
    pub context: String,
    pub source: StoreError,
}

impl ReconcileError {
    pub fn new(origin: Origin, context: impl Into<String>, source: StoreError) -> Self {
        Self { origin, context: context.into(), source }
    }

    pub fn local(context: impl Into<String>, source: StoreError) -> Self {
        Self::new(Origin::Local, context, source)
    }

    pub fn remote(context: impl Into<String>, source: StoreError) -> Self {
        Self::new(Origin::Remote, context, source)
    }

    pub fn propagation(context: impl Into<String>, source: StoreError) -> Self {
        Self::new(Origin::Propagation, context, source)
    }
}

/// Invalid agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid wait tiers: {0}")]
    WaitTiers(String),
}
