//! Service-state driven provisioning
//!
//! The filtering engine stops and restarts independently of driver
//! load/unload. The [`Provisioner`] subscribes once per session and cycles
//! the provisioning (provider, sublayer, callouts) on every running/stopping
//! transition; the subscription itself persists across engine restarts.

use crate::callout::{CalloutRegistrant, DatapathIngress};
use crate::config::FilterConfig;
use crate::context::TunnelContextTable;
use crate::engine::{FilterEngine, ServiceState, SessionId, StateSubscriber};
use crate::provider::ProviderRegistrant;
use crate::stats::FilterStats;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ProvisionerInner {
    provider: ProviderRegistrant,
    callouts: CalloutRegistrant,
    provisioned: bool,
}

/// State-notification subscriber driving (re-)provisioning.
///
/// The inner mutex serializes state transitions: at most one provisioning
/// or teardown runs at a time, and administrative unwind from
/// driver-unload goes through the same path as an engine-stop notification.
pub struct Provisioner {
    session: SessionId,
    table: Arc<TunnelContextTable>,
    stats: Arc<FilterStats>,
    inner: Mutex<ProvisionerInner>,
    /// Set at driver unload so a racing "running" notification cannot
    /// re-provision behind the teardown.
    retired: AtomicBool,
}

impl Provisioner {
    pub(crate) fn new(
        engine: Arc<dyn FilterEngine>,
        session: SessionId,
        table: Arc<TunnelContextTable>,
        ingress: Arc<dyn DatapathIngress>,
        stats: Arc<FilterStats>,
        config: &FilterConfig,
    ) -> Arc<Self> {
        let provider = ProviderRegistrant::new(engine.clone(), config);
        let callouts = CalloutRegistrant::new(
            engine,
            table.clone(),
            ingress,
            stats.clone(),
            config.monitored_layers.clone(),
        );
        Arc::new(Self {
            session,
            table,
            stats,
            inner: Mutex::new(ProvisionerInner {
                provider,
                callouts,
                provisioned: false,
            }),
            retired: AtomicBool::new(false),
        })
    }

    /// Bring up provider, sublayer and callouts, in that order. Failure
    /// unwinds whatever was just provisioned and leaves the subsystem
    /// subscribed-but-unprovisioned; a later running notification retries.
    fn provision(&self) {
        if self.retired.load(Ordering::Acquire) {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.provisioned {
            debug!("already provisioned");
            return;
        }
        self.stats.record_provision_cycle();

        if let Err(err) = inner.provider.add_system_provider(self.session) {
            warn!(%err, "provider registration failed, staying unprovisioned");
            self.stats.record_provision_failure();
            return;
        }
        if let Err(err) = inner.callouts.register_callouts(self.session) {
            warn!(%err, "callout registration failed, unwinding provider");
            inner.provider.remove_system_provider(self.session);
            self.stats.record_provision_failure();
            return;
        }

        inner.provisioned = true;
        info!("tunnel filter provisioned");
    }

    /// Tear down in reverse order (callouts with drain, then sublayer and
    /// provider), then discard all tunnel contexts: flow state tied to a
    /// dead engine session is meaningless.
    pub(crate) fn unprovision(&self) {
        let mut inner = self.inner.lock();
        inner.callouts.unregister_callouts(self.session);
        inner.provider.remove_system_provider(self.session);
        let was_provisioned = inner.provisioned;
        inner.provisioned = false;
        drop(inner);

        let dropped = self.table.invalidate_all();
        if was_provisioned {
            info!(dropped, "tunnel filter unprovisioned");
        }
    }

    /// Refuse any further provisioning; called once at driver unload before
    /// the final teardown.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// True while fully provisioned
    pub fn is_provisioned(&self) -> bool {
        self.inner.lock().provisioned
    }
}

impl StateSubscriber for Provisioner {
    fn state_changed(&self, state: ServiceState) {
        debug!(?state, "engine state notification");
        match state {
            ServiceState::Running => self.provision(),
            ServiceState::Stopping | ServiceState::Stopped => self.unprovision(),
            ServiceState::Starting => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callout::tests_support::NullIngress;
    use crate::testing::InMemoryEngine;

    fn provisioner(engine: &Arc<InMemoryEngine>) -> (Arc<Provisioner>, SessionId) {
        let config = FilterConfig::default();
        let stats = Arc::new(FilterStats::default());
        let table = Arc::new(TunnelContextTable::new(&config, stats.clone()));
        let session = engine.open_session().unwrap();
        let p = Provisioner::new(
            engine.clone(),
            session,
            table,
            Arc::new(NullIngress),
            stats,
            &config,
        );
        (p, session)
    }

    #[test]
    fn test_running_notification_provisions() {
        let engine = Arc::new(InMemoryEngine::running());
        let (p, _) = provisioner(&engine);

        p.state_changed(ServiceState::Running);
        assert!(p.is_provisioned());
        assert_eq!(engine.provider_count(), 1);
        assert_eq!(engine.sublayer_count(), 1);
        assert_eq!(engine.callout_count(), 2);

        // Repeated notification is a no-op.
        p.state_changed(ServiceState::Running);
        assert_eq!(engine.callout_count(), 2);
    }

    #[test]
    fn test_stopping_notification_unprovisions() {
        let engine = Arc::new(InMemoryEngine::running());
        let (p, _) = provisioner(&engine);
        p.state_changed(ServiceState::Running);

        p.state_changed(ServiceState::Stopping);
        assert!(!p.is_provisioned());
        assert_eq!(engine.provider_count(), 0);
        assert_eq!(engine.sublayer_count(), 0);
        assert_eq!(engine.callout_count(), 0);
    }

    #[test]
    fn test_callout_failure_unwinds_fully() {
        let engine = Arc::new(InMemoryEngine::running());
        engine.fail_callout_adds(true);
        let (p, _) = provisioner(&engine);

        p.state_changed(ServiceState::Running);
        assert!(!p.is_provisioned());
        assert_eq!(engine.provider_count(), 0);
        assert_eq!(engine.sublayer_count(), 0);
        assert_eq!(engine.callout_count(), 0);

        engine.fail_callout_adds(false);
        p.state_changed(ServiceState::Running);
        assert!(p.is_provisioned());
    }

    #[test]
    fn test_retired_provisioner_ignores_running() {
        let engine = Arc::new(InMemoryEngine::running());
        let (p, _) = provisioner(&engine);
        p.retire();
        p.state_changed(ServiceState::Running);
        assert!(!p.is_provisioned());
        assert_eq!(engine.provider_count(), 0);
    }
}
