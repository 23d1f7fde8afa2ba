//! Filter lifecycle management
//!
//! Top-level state machine invoked at driver load and unload:
//! `Unloaded -> Subscribed -> Unloaded`, with the provisioned state cycling
//! inside [`crate::subscriber::Provisioner`] as the engine starts and stops
//! underneath us.

use crate::callout::DatapathIngress;
use crate::config::FilterConfig;
use crate::context::TunnelContextTable;
use crate::engine::{FilterEngine, SessionId, SubscriptionId};
use crate::error::Result;
use crate::flow::FlowKey;
use crate::stats::FilterStats;
use crate::subscriber::Provisioner;
use parking_lot::Mutex;
use std::mem;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Coarse lifecycle phase, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Nothing is held
    Unloaded,
    /// Subscribed for state notifications; provisioning cycles with the
    /// engine. The intermediate session-open step is transient inside
    /// `initialize` and never observable.
    Subscribed,
}

enum LifecycleState {
    Unloaded,
    Subscribed {
        session: SessionId,
        subscription: SubscriptionId,
        provisioner: Arc<Provisioner>,
    },
}

/// The tunnel-traffic interception subsystem.
///
/// One instance per driver load. Holds the single engine session and
/// sequences every other component; all administrative transitions run
/// under one lock, so there is a single in-flight transition at a time.
pub struct TunnelFilter {
    engine: Arc<dyn FilterEngine>,
    table: Arc<TunnelContextTable>,
    stats: Arc<FilterStats>,
    state: Mutex<LifecycleState>,
}

impl std::fmt::Debug for TunnelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelFilter").finish_non_exhaustive()
    }
}

impl TunnelFilter {
    /// Driver-load entry point.
    ///
    /// Opens the engine session (failure here is fatal and nothing
    /// downstream is started) and subscribes for service-state
    /// notifications. If the engine is already running, subscription
    /// delivery provisions immediately; otherwise provisioning waits for
    /// the next running notification.
    pub fn initialize(
        engine: Arc<dyn FilterEngine>,
        ingress: Arc<dyn DatapathIngress>,
        config: FilterConfig,
    ) -> Result<TunnelFilter> {
        let config = config.normalized();
        let stats = Arc::new(FilterStats::default());
        let table = Arc::new(TunnelContextTable::new(&config, stats.clone()));

        let session = match engine.open_session() {
            Ok(session) => session,
            Err(err) => {
                error!(%err, "engine session open failed, tunnel filter unavailable");
                return Err(err);
            }
        };
        debug!(?session, "engine session opened");

        let provisioner = Provisioner::new(
            engine.clone(),
            session,
            table.clone(),
            ingress,
            stats.clone(),
            &config,
        );

        // Subscribing delivers the current engine state synchronously, so
        // the provisioner must be fully wired before this call.
        let subscription = match engine.subscribe_state(session, provisioner.clone()) {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(%err, "state subscription failed, closing session");
                engine.close_session(session);
                return Err(err);
            }
        };

        info!("tunnel filter initialized");
        Ok(TunnelFilter {
            engine,
            table,
            stats,
            state: Mutex::new(LifecycleState::Subscribed {
                session,
                subscription,
                provisioner,
            }),
        })
    }

    /// Driver-unload entry point. Unwinds in exact reverse order of
    /// bring-up: provisioning (draining in-flight classify calls), then the
    /// subscription, then the session. Idempotent, and safe after a failed
    /// or partial initialize.
    pub fn uninitialize(&self) {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, LifecycleState::Unloaded) {
            LifecycleState::Unloaded => {}
            LifecycleState::Subscribed {
                session,
                subscription,
                provisioner,
            } => {
                // Stop racing notifications from re-provisioning first.
                provisioner.retire();
                provisioner.unprovision();
                self.engine.unsubscribe_state(session, subscription);
                self.engine.close_session(session);
                info!("tunnel filter uninitialized");
            }
        }
    }

    /// Flow-teardown signal from the switch flow table: the flow keyed by
    /// `key` is gone, drop its interception state.
    pub fn flow_removed(&self, key: &FlowKey) {
        if self.table.invalidate(key) {
            debug!(?key, "tunnel context dropped on flow teardown");
        }
    }

    /// The per-flow tunnel context table
    pub fn context_table(&self) -> &Arc<TunnelContextTable> {
        &self.table
    }

    /// Filter counters
    pub fn stats(&self) -> &Arc<FilterStats> {
        &self.stats
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> LifecyclePhase {
        match *self.state.lock() {
            LifecycleState::Unloaded => LifecyclePhase::Unloaded,
            LifecycleState::Subscribed { .. } => LifecyclePhase::Subscribed,
        }
    }

    /// True while provider, sublayer and callouts are all registered
    pub fn is_provisioned(&self) -> bool {
        match &*self.state.lock() {
            LifecycleState::Unloaded => false,
            LifecycleState::Subscribed { provisioner, .. } => provisioner.is_provisioned(),
        }
    }
}

impl Drop for TunnelFilter {
    fn drop(&mut self) {
        self.uninitialize();
    }
}
