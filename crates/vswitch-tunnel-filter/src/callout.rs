//! Callout registration and packet classification
//!
//! One [`CalloutDispatch`] is built per provisioning cycle and installed at
//! every monitored traffic layer. The engine invokes it concurrently from
//! its packet workers; teardown removes the engine registrations first and
//! then drains in-flight classify calls before the dispatch is dropped, so
//! no classify call ever observes a half-torn-down context.

use crate::context::TunnelContextTable;
use crate::engine::{
    CalloutCallbacks, CalloutDesc, FilterEngine, FilterEvent, SessionId, TrafficLayer,
};
use crate::error::Result;
use crate::flow::{FlowKey, PacketMeta, RedirectTarget, TunnelKind, Verdict};
use crate::provider::SUBLAYER_KEY;
use crate::stats::FilterStats;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Stable callout key for the outbound IPv4 transport layer
pub const OUTBOUND_CALLOUT_KEY: Uuid = Uuid::from_u128(0x5b1f32c8_a4d0_4c6e_8f2b_9d7e04a1c553);
/// Stable callout key for the inbound IPv4 transport layer
pub const INBOUND_CALLOUT_KEY: Uuid = Uuid::from_u128(0x5b1f32c8_a4d0_4c6e_8f2b_9d7e04a1c554);

/// Key a layer's callout registers under
pub const fn callout_key(layer: TrafficLayer) -> Uuid {
    match layer {
        TrafficLayer::OutboundTransportV4 => OUTBOUND_CALLOUT_KEY,
        TrafficLayer::InboundTransportV4 => INBOUND_CALLOUT_KEY,
    }
}

/// Hand-off point into the switch datapath (owned by the excluded
/// encapsulation/flow-processing component).
pub trait DatapathIngress: Send + Sync {
    /// Deliver a redirected packet and its flow key to the datapath port
    fn redirect(&self, port: u32, key: FlowKey, packet: &PacketMeta);
}

struct GateInner {
    inflight: u64,
    closed: bool,
}

/// Counts in-flight classify invocations and supports a closing drain.
///
/// There is no cancellation: drain waits for natural completion, since
/// classification finishes in bounded time.
struct ClassifyGate {
    inner: Mutex<GateInner>,
    idle: Condvar,
}

impl ClassifyGate {
    fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                inflight: 0,
                closed: false,
            }),
            idle: Condvar::new(),
        }
    }

    /// Returns false when the gate is already closed for teardown.
    fn enter(&self) -> bool {
        let mut g = self.inner.lock();
        if g.closed {
            return false;
        }
        g.inflight += 1;
        true
    }

    fn exit(&self) {
        let mut g = self.inner.lock();
        g.inflight -= 1;
        if g.inflight == 0 {
            self.idle.notify_all();
        }
    }

    /// Refuse new entries and block until in-flight calls reach zero.
    fn close_and_drain(&self) {
        let mut g = self.inner.lock();
        g.closed = true;
        while g.inflight > 0 {
            self.idle.wait(&mut g);
        }
    }
}

/// Classify/notify implementation shared by every installed callout
pub struct CalloutDispatch {
    table: Arc<TunnelContextTable>,
    ingress: Arc<dyn DatapathIngress>,
    stats: Arc<FilterStats>,
    gate: ClassifyGate,
}

impl CalloutDispatch {
    fn new(
        table: Arc<TunnelContextTable>,
        ingress: Arc<dyn DatapathIngress>,
        stats: Arc<FilterStats>,
    ) -> Self {
        Self {
            table,
            ingress,
            stats,
            gate: ClassifyGate::new(),
        }
    }

    fn classify_inner(&self, layer: TrafficLayer, packet: &PacketMeta) -> Verdict {
        // Fast reject for the non-tunnel majority: no table access.
        let Some(kind) = TunnelKind::detect(packet) else {
            self.stats.record_pass_through();
            return Verdict::Continue;
        };

        let key = FlowKey::from_packet(packet);
        let ctx = match self.table.lookup_or_create(key, kind) {
            Ok(ctx) => ctx,
            Err(err) => {
                // Memory pressure or internal failure: the packet passes
                // through unclassified rather than faulting the path.
                self.stats.record_table_full();
                debug!(?key, %err, "classification degraded to continue");
                return Verdict::Continue;
            }
        };

        self.stats.record_classified();
        match ctx.redirect {
            RedirectTarget::Datapath { port } => {
                trace!(?layer, ?key, port, "redirecting tunnel packet to datapath");
                self.ingress.redirect(port, key, packet);
                self.stats.record_redirect();
                Verdict::Redirect
            }
            RedirectTarget::PassThrough => {
                self.stats.record_permit();
                Verdict::Permit
            }
            RedirectTarget::Drop => {
                self.stats.record_block();
                Verdict::Block
            }
        }
    }
}

impl CalloutCallbacks for CalloutDispatch {
    fn classify(&self, layer: TrafficLayer, packet: &PacketMeta) -> Verdict {
        if !self.gate.enter() {
            // Tearing down; the engine races us by design. Fail open.
            return Verdict::Continue;
        }
        let verdict = self.classify_inner(layer, packet);
        self.gate.exit();
        verdict
    }

    fn notify(&self, event: FilterEvent) {
        match event {
            FilterEvent::FilterAdded { callout, layer } => {
                debug!(%callout, ?layer, "filter installed for callout");
            }
            FilterEvent::FilterRemoved { callout, layer } => {
                // The backing filter is gone; flow state learned under it is
                // no longer meaningful.
                let dropped = self.table.invalidate_all();
                warn!(%callout, ?layer, dropped, "filter removed, tunnel contexts invalidated");
            }
        }
    }
}

/// Installs and withdraws this driver's callouts. Control-path only.
pub struct CalloutRegistrant {
    engine: Arc<dyn FilterEngine>,
    table: Arc<TunnelContextTable>,
    ingress: Arc<dyn DatapathIngress>,
    stats: Arc<FilterStats>,
    layers: Vec<TrafficLayer>,
    installed: Vec<Uuid>,
    dispatch: Option<Arc<CalloutDispatch>>,
}

impl CalloutRegistrant {
    pub(crate) fn new(
        engine: Arc<dyn FilterEngine>,
        table: Arc<TunnelContextTable>,
        ingress: Arc<dyn DatapathIngress>,
        stats: Arc<FilterStats>,
        layers: Vec<TrafficLayer>,
    ) -> Self {
        Self {
            engine,
            table,
            ingress,
            stats,
            layers,
            installed: Vec::new(),
            dispatch: None,
        }
    }

    /// Install one callout per monitored layer. Idempotent; partial failure
    /// removes whatever was just installed and returns the error.
    pub fn register_callouts(&mut self, session: SessionId) -> Result<()> {
        if self.dispatch.is_some() {
            debug!("callouts already registered");
            return Ok(());
        }

        let dispatch = Arc::new(CalloutDispatch::new(
            self.table.clone(),
            self.ingress.clone(),
            self.stats.clone(),
        ));

        for &layer in &self.layers {
            let desc = CalloutDesc {
                key: callout_key(layer),
                sublayer_key: SUBLAYER_KEY,
                layer,
                callbacks: dispatch.clone(),
            };
            if let Err(err) = self.engine.add_callout(session, desc) {
                warn!(?layer, %err, "callout registration failed, unwinding");
                for key in self.installed.drain(..) {
                    if let Err(err) = self.engine.remove_callout(session, key) {
                        debug!(%key, %err, "callout removal during unwind failed");
                    }
                }
                return Err(err);
            }
            self.installed.push(callout_key(layer));
        }

        info!(layers = self.installed.len(), "callouts registered");
        self.dispatch = Some(dispatch);
        Ok(())
    }

    /// Withdraw every installed callout, then drain in-flight classify
    /// invocations before releasing the dispatch. Idempotent.
    pub fn unregister_callouts(&mut self, session: SessionId) {
        let Some(dispatch) = self.dispatch.take() else {
            return;
        };

        for key in self.installed.drain(..) {
            if let Err(err) = self.engine.remove_callout(session, key) {
                debug!(%key, %err, "callout removal failed");
            }
        }

        // Drain-before-free: no classify call may outlive its callout.
        dispatch.gate.close_and_drain();
        info!("callouts unregistered and drained");
    }

    /// True while callouts are installed
    pub fn is_registered(&self) -> bool {
        self.dispatch.is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::DatapathIngress;
    use crate::flow::{FlowKey, PacketMeta};

    /// Ingress that swallows redirected packets
    pub(crate) struct NullIngress;

    impl DatapathIngress for NullIngress {
        fn redirect(&self, _port: u32, _key: FlowKey, _packet: &PacketMeta) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct RecordingIngress {
        handoffs: AtomicU64,
    }

    impl DatapathIngress for RecordingIngress {
        fn redirect(&self, _port: u32, _key: FlowKey, _packet: &PacketMeta) {
            self.handoffs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dispatch() -> (Arc<CalloutDispatch>, Arc<TunnelContextTable>, Arc<RecordingIngress>) {
        let stats = Arc::new(FilterStats::default());
        let table = Arc::new(TunnelContextTable::new(&FilterConfig::default(), stats.clone()));
        let ingress = Arc::new(RecordingIngress::default());
        let dispatch = Arc::new(CalloutDispatch::new(
            table.clone(),
            ingress.clone(),
            stats,
        ));
        (dispatch, table, ingress)
    }

    fn tunnel_packet() -> PacketMeta {
        PacketMeta {
            src_ip: 0x0A000001,
            dst_ip: 0x0A000002,
            src_port: 50000,
            dst_port: crate::flow::VXLAN_UDP_PORT,
            protocol: 17,
            len: 1400,
        }
    }

    #[test]
    fn test_non_tunnel_traffic_continues_without_table_access() {
        let (dispatch, table, ingress) = dispatch();
        let pkt = PacketMeta {
            dst_port: 443,
            protocol: 6,
            ..tunnel_packet()
        };
        let verdict = dispatch.classify(TrafficLayer::OutboundTransportV4, &pkt);
        assert_eq!(verdict, Verdict::Continue);
        assert!(table.is_empty());
        assert_eq!(ingress.handoffs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tunnel_packet_redirected_to_datapath() {
        let (dispatch, table, ingress) = dispatch();
        let verdict = dispatch.classify(TrafficLayer::OutboundTransportV4, &tunnel_packet());
        assert_eq!(verdict, Verdict::Redirect);
        assert_eq!(table.len(), 1);
        assert_eq!(ingress.handoffs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_redirect_target_drives_verdict() {
        let (dispatch, table, _) = dispatch();
        let pkt = tunnel_packet();
        let key = FlowKey::from_packet(&pkt);
        dispatch.classify(TrafficLayer::OutboundTransportV4, &pkt);

        table.set_redirect(&key, RedirectTarget::Drop);
        assert_eq!(
            dispatch.classify(TrafficLayer::OutboundTransportV4, &pkt),
            Verdict::Block
        );

        table.set_redirect(&key, RedirectTarget::PassThrough);
        assert_eq!(
            dispatch.classify(TrafficLayer::OutboundTransportV4, &pkt),
            Verdict::Permit
        );
    }

    #[test]
    fn test_table_full_degrades_to_continue() {
        let stats = Arc::new(FilterStats::default());
        let config = FilterConfig {
            max_contexts: 0,
            ..Default::default()
        };
        let table = Arc::new(TunnelContextTable::new(&config, stats.clone()));
        let dispatch = CalloutDispatch::new(
            table,
            Arc::new(RecordingIngress::default()),
            stats.clone(),
        );
        let verdict = dispatch.classify(TrafficLayer::InboundTransportV4, &tunnel_packet());
        assert_eq!(verdict, Verdict::Continue);
        assert_eq!(stats.snapshot().table_full_drops, 1);
    }

    #[test]
    fn test_closed_gate_fails_open() {
        let (dispatch, table, _) = dispatch();
        dispatch.gate.close_and_drain();
        let verdict = dispatch.classify(TrafficLayer::OutboundTransportV4, &tunnel_packet());
        assert_eq!(verdict, Verdict::Continue);
        assert!(table.is_empty());
    }

    #[test]
    fn test_filter_removed_notification_flushes_contexts() {
        let (dispatch, table, _) = dispatch();
        dispatch.classify(TrafficLayer::OutboundTransportV4, &tunnel_packet());
        assert_eq!(table.len(), 1);

        dispatch.notify(FilterEvent::FilterRemoved {
            callout: OUTBOUND_CALLOUT_KEY,
            layer: TrafficLayer::OutboundTransportV4,
        });
        assert!(table.is_empty());
    }
}
