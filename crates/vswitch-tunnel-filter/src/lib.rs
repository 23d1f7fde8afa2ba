//! Tunnel-traffic interception for the virtual switch datapath
//!
//! This crate hooks the host packet-filtering engine and redirects
//! tunnel-encapsulated traffic (VXLAN, Geneve, GRE, STT) into the switch's
//! own datapath for encapsulation/decapsulation and flow processing.
//!
//! # Architecture
//!
//! ```text
//!  driver load                     filtering engine
//!      │                                 │
//!      ▼                                 │ state notifications
//!  TunnelFilter ──open session──►        │
//!      │                                 ▼
//!      └─subscribe────────────►  Provisioner
//!                                    │ on running: provider → sublayer → callouts
//!                                    │ on stopping: reverse, drain, flush contexts
//!                                    ▼
//!                              CalloutDispatch ◄──classify── packet workers
//!                                    │
//!                                    ▼
//!                            TunnelContextTable ──redirect──► DatapathIngress
//! ```
//!
//! The engine can stop and restart independently of driver load/unload; the
//! subscription persists and only the provisioning cycles. Teardown always
//! runs in exact reverse order of bring-up and drains in-flight classify
//! invocations before callout memory is released.
//!
//! The host engine itself is behind the [`FilterEngine`] trait;
//! [`testing::InMemoryEngine`] implements it in-process for the test suite.

#![warn(missing_docs)]

pub mod callout;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod flow;
pub mod lifecycle;
pub mod list;
pub mod provider;
pub mod stats;
pub mod subscriber;
pub mod testing;

pub use callout::{CalloutRegistrant, DatapathIngress};
pub use config::FilterConfig;
pub use context::{TunnelContext, TunnelContextTable};
pub use engine::{
    CalloutCallbacks, FilterEngine, FilterEvent, ServiceState, SessionId, StateSubscriber,
    SubscriptionId, TrafficLayer,
};
pub use error::{FilterError, Result};
pub use flow::{FlowKey, PacketMeta, RedirectTarget, TunnelKind, Verdict};
pub use lifecycle::{LifecyclePhase, TunnelFilter};
pub use list::{ListArena, NodeId};
pub use provider::ProviderRegistrant;
pub use stats::{FilterStats, StatsSnapshot};
pub use subscriber::Provisioner;

/// Microseconds since the Unix epoch
#[inline(always)]
pub(crate) fn timestamp_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
