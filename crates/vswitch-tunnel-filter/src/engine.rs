//! Seam to the host packet-filtering engine
//!
//! The tunnel filter registers into a host filtering engine it does not own:
//! the engine hands out sessions, accepts provider/sublayer/callout
//! registrations, and invokes classify/notify callbacks from its own worker
//! contexts. Everything the filter needs from the engine is expressed by the
//! [`FilterEngine`] trait; [`crate::testing::InMemoryEngine`] is the
//! in-process implementation used by the test suite.

use crate::error::Result;
use crate::flow::{PacketMeta, Verdict};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Filtering-engine service state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Engine is not running; registrations are gone
    Stopped,
    /// Engine is coming up
    Starting,
    /// Engine accepts registrations and classifies packets
    Running,
    /// Engine is going down; registrations should be withdrawn
    Stopping,
}

/// Opaque handle to an open engine session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

/// Token for an active service-state subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// Traffic layer a callout attaches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficLayer {
    /// Outbound IPv4 transport layer
    OutboundTransportV4,
    /// Inbound IPv4 transport layer
    InboundTransportV4,
}

/// Provider identity record advertising this driver to the engine
#[derive(Debug, Clone)]
pub struct ProviderDesc {
    /// Stable provider key
    pub key: Uuid,
    /// Display name
    pub name: String,
    /// Human-readable description
    pub description: String,
}

/// Ordering layer under which this driver's filters are evaluated
#[derive(Debug, Clone)]
pub struct SublayerDesc {
    /// Stable sublayer key
    pub key: Uuid,
    /// Owning provider; must already be registered
    pub provider_key: Uuid,
    /// Display name
    pub name: String,
    /// Evaluation weight relative to other sublayers
    pub weight: u16,
}

/// Classify/notify callback pair bound to one traffic layer
#[derive(Clone)]
pub struct CalloutDesc {
    /// Stable callout key
    pub key: Uuid,
    /// Owning sublayer; must already be registered
    pub sublayer_key: Uuid,
    /// Layer the callout intercepts
    pub layer: TrafficLayer,
    /// Callback implementation invoked by the engine
    pub callbacks: Arc<dyn CalloutCallbacks>,
}

impl std::fmt::Debug for CalloutDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalloutDesc")
            .field("key", &self.key)
            .field("sublayer_key", &self.sublayer_key)
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

/// Filter lifecycle event delivered to a callout's notify callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterEvent {
    /// A filter using this callout was installed
    FilterAdded {
        /// Callout the filter is bound to
        callout: Uuid,
        /// Layer the filter evaluates at
        layer: TrafficLayer,
    },
    /// A filter using this callout was removed
    FilterRemoved {
        /// Callout the filter was bound to
        callout: Uuid,
        /// Layer the filter evaluated at
        layer: TrafficLayer,
    },
}

/// Callbacks the engine invokes on its packet-processing workers.
///
/// `classify` runs concurrently with itself and with control-path
/// operations; it must complete in bounded time and never block
/// indefinitely.
pub trait CalloutCallbacks: Send + Sync {
    /// Per-packet classification decision
    fn classify(&self, layer: TrafficLayer, packet: &PacketMeta) -> Verdict;

    /// Filter lifecycle notification
    fn notify(&self, event: FilterEvent);
}

/// Receiver for service-state transition notifications
pub trait StateSubscriber: Send + Sync {
    /// Called for every engine state transition. Also called once at
    /// subscribe time with the current state.
    fn state_changed(&self, state: ServiceState);
}

/// Host filtering engine operations consumed by this subsystem.
///
/// Contract highlights, enforced by any conforming implementation:
///
/// - At most one active state subscription per session; subscribing
///   synchronously delivers the current state so a subscriber that arrives
///   while the engine is already running provisions immediately.
/// - `add_sublayer` requires its provider, `add_callout` its sublayer
///   ([`crate::FilterError::DependencyMissing`] otherwise); removal is the
///   reverse ([`crate::FilterError::InUse`]).
/// - Additions require [`ServiceState::Running`]; removals are accepted in
///   any state.
/// - Transitioning to [`ServiceState::Stopped`] wipes all registrations:
///   engine runtime state does not survive a restart.
pub trait FilterEngine: Send + Sync {
    /// Open a session; the handle scopes every other operation
    fn open_session(&self) -> Result<SessionId>;

    /// Close a session, dropping any subscription still bound to it
    fn close_session(&self, session: SessionId);

    /// Current service state
    fn current_state(&self) -> ServiceState;

    /// Register a state-transition subscriber for `session`
    fn subscribe_state(
        &self,
        session: SessionId,
        subscriber: Arc<dyn StateSubscriber>,
    ) -> Result<SubscriptionId>;

    /// Cancel a state subscription
    fn unsubscribe_state(&self, session: SessionId, subscription: SubscriptionId);

    /// Register a provider identity record
    fn add_provider(&self, session: SessionId, provider: &ProviderDesc) -> Result<()>;

    /// Remove a provider; fails while sublayers still reference it
    fn remove_provider(&self, session: SessionId, key: Uuid) -> Result<()>;

    /// Register a sublayer under an existing provider
    fn add_sublayer(&self, session: SessionId, sublayer: &SublayerDesc) -> Result<()>;

    /// Remove a sublayer; fails while callouts still reference it
    fn remove_sublayer(&self, session: SessionId, key: Uuid) -> Result<()>;

    /// Register a callout under an existing sublayer
    fn add_callout(&self, session: SessionId, callout: CalloutDesc) -> Result<()>;

    /// Remove a callout
    fn remove_callout(&self, session: SessionId, key: Uuid) -> Result<()>;
}
