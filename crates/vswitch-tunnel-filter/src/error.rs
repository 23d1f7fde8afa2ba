//! Error types for the tunnel filter

use crate::engine::ServiceState;
use thiserror::Error;

/// Tunnel filter error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The filtering engine refused to open a session. Fatal to bring-up.
    #[error("engine session open failed: {0}")]
    SessionOpen(String),

    /// Operation referenced a session the engine does not know about
    #[error("invalid engine session")]
    InvalidSession,

    /// Registration attempted while the engine is not running
    #[error("engine unavailable (state {0:?})")]
    EngineUnavailable(ServiceState),

    /// A registration object with the same key already exists
    #[error("{kind} already registered")]
    AlreadyRegistered {
        /// Object kind (provider, sublayer, callout)
        kind: &'static str,
    },

    /// Removal of an object that is not registered
    #[error("{kind} not registered")]
    NotRegistered {
        /// Object kind (provider, sublayer, callout)
        kind: &'static str,
    },

    /// Registration ordering violated: a dependency is missing
    #[error("{kind} registration requires {missing}")]
    DependencyMissing {
        /// Object being registered
        kind: &'static str,
        /// Dependency that does not exist yet
        missing: &'static str,
    },

    /// Removal ordering violated: dependents still reference the object
    #[error("{kind} still referenced by dependent objects")]
    InUse {
        /// Object being removed
        kind: &'static str,
    },

    /// A session already carries an active state subscription
    #[error("session already has an active state subscription")]
    SubscriptionExists,

    /// Tunnel context table is at capacity
    #[error("tunnel context table full")]
    ContextTableFull,

    /// Transient engine-side failure (e.g. resource exhaustion inside the
    /// engine); retried on the next provisioning cycle
    #[error("engine internal failure")]
    EngineFailure,
}

/// Result type for the tunnel filter
pub type Result<T> = std::result::Result<T, FilterError>;
