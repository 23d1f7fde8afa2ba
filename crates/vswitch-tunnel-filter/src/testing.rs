//! In-process filtering engine for tests
//!
//! [`InMemoryEngine`] implements [`FilterEngine`] with the full engine-side
//! contract: session scoping, one subscription per session, registration
//! dependency ordering, duplicate detection, and loss of all runtime state
//! on a stop. Tests drive it with [`InMemoryEngine::transition`] and
//! [`InMemoryEngine::inject`] to exercise the subsystem without a host
//! engine.

use crate::engine::{
    CalloutDesc, FilterEngine, FilterEvent, ProviderDesc, ServiceState, SessionId, StateSubscriber,
    SublayerDesc, SubscriptionId,
};
use crate::error::{FilterError, Result};
use crate::flow::{PacketMeta, Verdict};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// In-memory [`FilterEngine`] implementation
pub struct InMemoryEngine {
    state: Mutex<ServiceState>,
    next_id: AtomicU64,
    sessions: Mutex<HashSet<u64>>,
    subscriptions: Mutex<HashMap<u64, (u64, Arc<dyn StateSubscriber>)>>,
    providers: Mutex<HashMap<Uuid, ProviderDesc>>,
    sublayers: Mutex<HashMap<Uuid, SublayerDesc>>,
    /// Read from the simulated packet path, mutated from the control path
    callouts: DashMap<Uuid, CalloutDesc>,
    refuse_sessions: AtomicBool,
    fail_sublayer_adds: AtomicBool,
    fail_callout_adds: AtomicBool,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    /// Engine in the stopped state
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::Stopped),
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            sublayers: Mutex::new(HashMap::new()),
            callouts: DashMap::new(),
            refuse_sessions: AtomicBool::new(false),
            fail_sublayer_adds: AtomicBool::new(false),
            fail_callout_adds: AtomicBool::new(false),
        }
    }

    /// Engine already in the running state
    pub fn running() -> Self {
        let engine = Self::new();
        *engine.state.lock() = ServiceState::Running;
        engine
    }

    /// Transition the service state and notify every subscriber.
    ///
    /// Entering [`ServiceState::Stopped`] wipes all registrations, matching
    /// a real engine restart losing its runtime state.
    pub fn transition(&self, to: ServiceState) {
        *self.state.lock() = to;
        if to == ServiceState::Stopped {
            self.providers.lock().clear();
            self.sublayers.lock().clear();
            self.callouts.clear();
        }
        debug!(?to, "engine state transition");

        let subscribers: Vec<Arc<dyn StateSubscriber>> = self
            .subscriptions
            .lock()
            .values()
            .map(|(_, s)| s.clone())
            .collect();
        for subscriber in subscribers {
            subscriber.state_changed(to);
        }
    }

    /// Run the classify path for `packet` at `layer`, as the engine's
    /// packet workers would. [`Verdict::Continue`] when no callout is
    /// installed there.
    pub fn inject(&self, layer: crate::engine::TrafficLayer, packet: &PacketMeta) -> Verdict {
        let callbacks = self
            .callouts
            .iter()
            .find(|entry| entry.layer == layer)
            .map(|entry| entry.callbacks.clone());
        match callbacks {
            Some(callbacks) => callbacks.classify(layer, packet),
            None => Verdict::Continue,
        }
    }

    /// Deliver a filter-removed notification to every installed callout, as
    /// if an administrator deleted the filters out from under the driver.
    pub fn revoke_filters(&self) {
        let installed: Vec<CalloutDesc> =
            self.callouts.iter().map(|e| e.value().clone()).collect();
        for desc in installed {
            desc.callbacks.notify(FilterEvent::FilterRemoved {
                callout: desc.key,
                layer: desc.layer,
            });
        }
    }

    /// Make `open_session` fail, for fatal bring-up tests
    pub fn refuse_sessions(&self, refuse: bool) {
        self.refuse_sessions.store(refuse, Ordering::SeqCst);
    }

    /// Inject a transient failure into sublayer registration
    pub fn fail_sublayer_adds(&self, fail: bool) {
        self.fail_sublayer_adds.store(fail, Ordering::SeqCst);
    }

    /// Inject a transient failure into callout registration
    pub fn fail_callout_adds(&self, fail: bool) {
        self.fail_callout_adds.store(fail, Ordering::SeqCst);
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Number of active state subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Number of registered providers
    pub fn provider_count(&self) -> usize {
        self.providers.lock().len()
    }

    /// Number of registered sublayers
    pub fn sublayer_count(&self) -> usize {
        self.sublayers.lock().len()
    }

    /// Number of registered callouts
    pub fn callout_count(&self) -> usize {
        self.callouts.len()
    }

    fn check_session(&self, session: SessionId) -> Result<()> {
        if self.sessions.lock().contains(&session.0) {
            Ok(())
        } else {
            Err(FilterError::InvalidSession)
        }
    }

    fn check_running(&self) -> Result<()> {
        let state = *self.state.lock();
        if state == ServiceState::Running {
            Ok(())
        } else {
            Err(FilterError::EngineUnavailable(state))
        }
    }
}

impl FilterEngine for InMemoryEngine {
    fn open_session(&self) -> Result<SessionId> {
        if self.refuse_sessions.load(Ordering::SeqCst) {
            return Err(FilterError::SessionOpen("engine refused session".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().insert(id);
        Ok(SessionId(id))
    }

    fn close_session(&self, session: SessionId) {
        self.sessions.lock().remove(&session.0);
        self.subscriptions
            .lock()
            .retain(|_, (owner, _)| *owner != session.0);
    }

    fn current_state(&self) -> ServiceState {
        *self.state.lock()
    }

    fn subscribe_state(
        &self,
        session: SessionId,
        subscriber: Arc<dyn StateSubscriber>,
    ) -> Result<SubscriptionId> {
        self.check_session(session)?;
        {
            let mut subs = self.subscriptions.lock();
            if subs.values().any(|(owner, _)| *owner == session.0) {
                return Err(FilterError::SubscriptionExists);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            subs.insert(id, (session.0, subscriber.clone()));
            drop(subs);
            // Deliver the current state outside the subscription lock; the
            // subscriber may provision immediately.
            subscriber.state_changed(self.current_state());
            Ok(SubscriptionId(id))
        }
    }

    fn unsubscribe_state(&self, session: SessionId, subscription: SubscriptionId) {
        let _ = session;
        self.subscriptions.lock().remove(&subscription.0);
    }

    fn add_provider(&self, session: SessionId, provider: &ProviderDesc) -> Result<()> {
        self.check_session(session)?;
        self.check_running()?;
        let mut providers = self.providers.lock();
        if providers.contains_key(&provider.key) {
            return Err(FilterError::AlreadyRegistered { kind: "provider" });
        }
        providers.insert(provider.key, provider.clone());
        Ok(())
    }

    fn remove_provider(&self, session: SessionId, key: Uuid) -> Result<()> {
        self.check_session(session)?;
        if self.sublayers.lock().values().any(|s| s.provider_key == key) {
            return Err(FilterError::InUse { kind: "provider" });
        }
        match self.providers.lock().remove(&key) {
            Some(_) => Ok(()),
            None => Err(FilterError::NotRegistered { kind: "provider" }),
        }
    }

    fn add_sublayer(&self, session: SessionId, sublayer: &SublayerDesc) -> Result<()> {
        self.check_session(session)?;
        self.check_running()?;
        if self.fail_sublayer_adds.load(Ordering::SeqCst) {
            return Err(FilterError::EngineFailure);
        }
        if !self.providers.lock().contains_key(&sublayer.provider_key) {
            return Err(FilterError::DependencyMissing {
                kind: "sublayer",
                missing: "provider",
            });
        }
        let mut sublayers = self.sublayers.lock();
        if sublayers.contains_key(&sublayer.key) {
            return Err(FilterError::AlreadyRegistered { kind: "sublayer" });
        }
        sublayers.insert(sublayer.key, sublayer.clone());
        Ok(())
    }

    fn remove_sublayer(&self, session: SessionId, key: Uuid) -> Result<()> {
        self.check_session(session)?;
        if self.callouts.iter().any(|c| c.sublayer_key == key) {
            return Err(FilterError::InUse { kind: "sublayer" });
        }
        match self.sublayers.lock().remove(&key) {
            Some(_) => Ok(()),
            None => Err(FilterError::NotRegistered { kind: "sublayer" }),
        }
    }

    fn add_callout(&self, session: SessionId, callout: CalloutDesc) -> Result<()> {
        self.check_session(session)?;
        self.check_running()?;
        if self.fail_callout_adds.load(Ordering::SeqCst) {
            return Err(FilterError::EngineFailure);
        }
        if !self.sublayers.lock().contains_key(&callout.sublayer_key) {
            return Err(FilterError::DependencyMissing {
                kind: "callout",
                missing: "sublayer",
            });
        }
        if self.callouts.contains_key(&callout.key) {
            return Err(FilterError::AlreadyRegistered { kind: "callout" });
        }
        let event = FilterEvent::FilterAdded {
            callout: callout.key,
            layer: callout.layer,
        };
        let callbacks = callout.callbacks.clone();
        self.callouts.insert(callout.key, callout);
        callbacks.notify(event);
        Ok(())
    }

    fn remove_callout(&self, session: SessionId, key: Uuid) -> Result<()> {
        self.check_session(session)?;
        match self.callouts.remove(&key) {
            Some(_) => Ok(()),
            None => Err(FilterError::NotRegistered { kind: "callout" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TrafficLayer;

    fn provider_desc() -> ProviderDesc {
        ProviderDesc {
            key: Uuid::from_u128(1),
            name: "p".into(),
            description: "test provider".into(),
        }
    }

    fn sublayer_desc() -> SublayerDesc {
        SublayerDesc {
            key: Uuid::from_u128(2),
            provider_key: Uuid::from_u128(1),
            name: "s".into(),
            weight: 1,
        }
    }

    struct NopCallbacks;

    impl crate::engine::CalloutCallbacks for NopCallbacks {
        fn classify(&self, _layer: TrafficLayer, _packet: &PacketMeta) -> Verdict {
            Verdict::Continue
        }
        fn notify(&self, _event: FilterEvent) {}
    }

    fn callout_desc() -> CalloutDesc {
        CalloutDesc {
            key: Uuid::from_u128(3),
            sublayer_key: Uuid::from_u128(2),
            layer: TrafficLayer::OutboundTransportV4,
            callbacks: Arc::new(NopCallbacks),
        }
    }

    #[test]
    fn test_sublayer_requires_provider() {
        let engine = InMemoryEngine::running();
        let session = engine.open_session().unwrap();

        let err = engine.add_sublayer(session, &sublayer_desc()).unwrap_err();
        assert_eq!(
            err,
            FilterError::DependencyMissing {
                kind: "sublayer",
                missing: "provider",
            }
        );
    }

    #[test]
    fn test_callout_requires_sublayer() {
        let engine = InMemoryEngine::running();
        let session = engine.open_session().unwrap();
        engine.add_provider(session, &provider_desc()).unwrap();

        let err = engine.add_callout(session, callout_desc()).unwrap_err();
        assert_eq!(
            err,
            FilterError::DependencyMissing {
                kind: "callout",
                missing: "sublayer",
            }
        );
    }

    #[test]
    fn test_removal_ordering_enforced() {
        let engine = InMemoryEngine::running();
        let session = engine.open_session().unwrap();
        engine.add_provider(session, &provider_desc()).unwrap();
        engine.add_sublayer(session, &sublayer_desc()).unwrap();
        engine.add_callout(session, callout_desc()).unwrap();

        assert_eq!(
            engine
                .remove_provider(session, Uuid::from_u128(1))
                .unwrap_err(),
            FilterError::InUse { kind: "provider" }
        );
        assert_eq!(
            engine
                .remove_sublayer(session, Uuid::from_u128(2))
                .unwrap_err(),
            FilterError::InUse { kind: "sublayer" }
        );

        engine.remove_callout(session, Uuid::from_u128(3)).unwrap();
        engine.remove_sublayer(session, Uuid::from_u128(2)).unwrap();
        engine.remove_provider(session, Uuid::from_u128(1)).unwrap();
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let engine = InMemoryEngine::running();
        let session = engine.open_session().unwrap();
        engine.add_provider(session, &provider_desc()).unwrap();

        assert_eq!(
            engine.add_provider(session, &provider_desc()).unwrap_err(),
            FilterError::AlreadyRegistered { kind: "provider" }
        );
    }

    #[test]
    fn test_additions_require_running_state() {
        let engine = InMemoryEngine::new();
        let session = engine.open_session().unwrap();

        assert_eq!(
            engine.add_provider(session, &provider_desc()).unwrap_err(),
            FilterError::EngineUnavailable(ServiceState::Stopped)
        );
    }

    #[test]
    fn test_stop_wipes_registrations() {
        let engine = InMemoryEngine::running();
        let session = engine.open_session().unwrap();
        engine.add_provider(session, &provider_desc()).unwrap();
        engine.add_sublayer(session, &sublayer_desc()).unwrap();

        engine.transition(ServiceState::Stopped);
        assert_eq!(engine.provider_count(), 0);
        assert_eq!(engine.sublayer_count(), 0);
    }

    #[test]
    fn test_one_subscription_per_session() {
        let engine = InMemoryEngine::new();
        let session = engine.open_session().unwrap();

        struct Nop;
        impl StateSubscriber for Nop {
            fn state_changed(&self, _state: ServiceState) {}
        }

        engine.subscribe_state(session, Arc::new(Nop)).unwrap();
        assert_eq!(
            engine.subscribe_state(session, Arc::new(Nop)).unwrap_err(),
            FilterError::SubscriptionExists
        );
    }

    #[test]
    fn test_invalid_session_rejected() {
        let engine = InMemoryEngine::running();
        assert_eq!(
            engine
                .add_provider(SessionId(999), &provider_desc())
                .unwrap_err(),
            FilterError::InvalidSession
        );
    }
}
