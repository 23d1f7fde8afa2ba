//! End-to-end lifecycle scenarios against the in-memory engine

use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vswitch_tunnel_filter::testing::InMemoryEngine;
use vswitch_tunnel_filter::{
    DatapathIngress, FilterConfig, FlowKey, LifecyclePhase, PacketMeta, ServiceState,
    TrafficLayer, TunnelFilter, Verdict,
};

struct NullIngress;

impl DatapathIngress for NullIngress {
    fn redirect(&self, _port: u32, _key: FlowKey, _packet: &PacketMeta) {}
}

/// Ingress that parks redirected packets until the test releases them
struct BlockingIngress {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl DatapathIngress for BlockingIngress {
    fn redirect(&self, _port: u32, _key: FlowKey, _packet: &PacketMeta) {
        self.entered.send(()).unwrap();
        self.release.recv().unwrap();
    }
}

fn vxlan_packet() -> PacketMeta {
    PacketMeta {
        src_ip: 0x0A000001,
        dst_ip: 0x0A000002,
        src_port: 52000,
        dst_port: 4789,
        protocol: 17,
        len: 1450,
    }
}

fn initialize(engine: &Arc<InMemoryEngine>) -> TunnelFilter {
    TunnelFilter::initialize(
        engine.clone(),
        Arc::new(NullIngress),
        FilterConfig::default(),
    )
    .expect("initialize")
}

#[test]
fn engine_restart_cycles_provisioning_and_discards_flow_state() {
    let engine = Arc::new(InMemoryEngine::running());
    let filter = initialize(&engine);
    assert!(filter.is_provisioned());

    // Learn one flow.
    let pkt = vxlan_packet();
    assert_eq!(
        engine.inject(TrafficLayer::OutboundTransportV4, &pkt),
        Verdict::Redirect
    );
    let key = FlowKey::from_packet(&pkt);
    let original = filter.context_table().lookup(&key).expect("context");

    // Engine goes down: callouts unregistered, contexts flushed.
    engine.transition(ServiceState::Stopping);
    assert!(!filter.is_provisioned());
    assert!(filter.context_table().is_empty());
    assert_eq!(engine.callout_count(), 0);
    assert_eq!(engine.provider_count(), 0);
    engine.transition(ServiceState::Stopped);

    // Engine comes back: everything is re-registered and the old flow is
    // learned from scratch, not resurrected.
    engine.transition(ServiceState::Running);
    assert!(filter.is_provisioned());
    assert_eq!(engine.provider_count(), 1);
    assert_eq!(engine.sublayer_count(), 1);
    assert_eq!(engine.callout_count(), 2);

    assert_eq!(
        engine.inject(TrafficLayer::OutboundTransportV4, &pkt),
        Verdict::Redirect
    );
    let fresh = filter.context_table().lookup(&key).expect("context");
    assert_ne!(fresh.id, original.id);
    assert_eq!(fresh.ref_count, 1);
}

#[test]
fn partial_provisioning_failure_unwinds_and_retries() {
    let engine = Arc::new(InMemoryEngine::new());
    let filter = initialize(&engine);
    assert_eq!(filter.phase(), LifecyclePhase::Subscribed);
    assert!(!filter.is_provisioned());

    // Provider and sublayer succeed, callout registration fails: the whole
    // provisioning cycle must unwind.
    engine.fail_callout_adds(true);
    engine.transition(ServiceState::Running);
    assert!(!filter.is_provisioned());
    assert_eq!(engine.provider_count(), 0);
    assert_eq!(engine.sublayer_count(), 0);
    assert_eq!(engine.callout_count(), 0);
    assert_eq!(filter.phase(), LifecyclePhase::Subscribed);
    assert_eq!(filter.stats().snapshot().provision_failures, 1);

    // Interception is silently suspended; packets pass unclassified.
    assert_eq!(
        engine.inject(TrafficLayer::OutboundTransportV4, &vxlan_packet()),
        Verdict::Continue
    );

    // The next running notification retries and succeeds.
    engine.fail_callout_adds(false);
    engine.transition(ServiceState::Running);
    assert!(filter.is_provisioned());
    assert_eq!(engine.callout_count(), 2);
}

#[test]
fn unload_waits_for_inflight_classification() {
    let engine = Arc::new(InMemoryEngine::running());
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let filter = Arc::new(
        TunnelFilter::initialize(
            engine.clone(),
            Arc::new(BlockingIngress {
                entered: entered_tx,
                release: release_rx,
            }),
            FilterConfig::default(),
        )
        .expect("initialize"),
    );

    // A classify call parks inside the datapath hand-off.
    let classify_engine = engine.clone();
    let classify = thread::spawn(move || {
        classify_engine.inject(TrafficLayer::OutboundTransportV4, &vxlan_packet())
    });
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("classify entered ingress");

    // Unload must drain the in-flight call before returning.
    let (done_tx, done_rx) = bounded(1);
    let unload_filter = filter.clone();
    let unload = thread::spawn(move || {
        unload_filter.uninitialize();
        done_tx.send(()).unwrap();
    });
    assert!(
        done_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "uninitialize returned while a classify call was in flight"
    );

    // Release the packet; the verdict completes and unload finishes.
    release_tx.send(()).unwrap();
    assert_eq!(classify.join().unwrap(), Verdict::Redirect);
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("uninitialize completed");
    unload.join().unwrap();

    assert_eq!(filter.phase(), LifecyclePhase::Unloaded);
    assert_eq!(engine.callout_count(), 0);
    assert_eq!(engine.session_count(), 0);
}

#[test]
fn teardown_after_unload_leaves_engine_clean() {
    let engine = Arc::new(InMemoryEngine::running());
    let filter = initialize(&engine);

    engine.inject(TrafficLayer::InboundTransportV4, &vxlan_packet());
    filter.uninitialize();

    assert_eq!(engine.provider_count(), 0);
    assert_eq!(engine.sublayer_count(), 0);
    assert_eq!(engine.callout_count(), 0);
    assert_eq!(engine.subscription_count(), 0);
    assert_eq!(engine.session_count(), 0);
    assert!(filter.context_table().is_empty());

    // Notifications after unload are inert.
    engine.transition(ServiceState::Running);
    assert_eq!(engine.provider_count(), 0);
}

#[test]
fn revoked_filters_flush_contexts_but_keep_callouts() {
    let engine = Arc::new(InMemoryEngine::running());
    let filter = initialize(&engine);

    engine.inject(TrafficLayer::OutboundTransportV4, &vxlan_packet());
    assert_eq!(filter.context_table().len(), 1);

    engine.revoke_filters();
    assert!(filter.context_table().is_empty());
    assert_eq!(engine.callout_count(), 2);

    // Traffic after the notification is re-learned.
    assert_eq!(
        engine.inject(TrafficLayer::OutboundTransportV4, &vxlan_packet()),
        Verdict::Redirect
    );
    assert_eq!(filter.context_table().len(), 1);
}

#[test]
fn stats_track_classification_outcomes() {
    let engine = Arc::new(InMemoryEngine::running());
    let filter = initialize(&engine);

    let plain = PacketMeta {
        dst_port: 443,
        protocol: 6,
        ..vxlan_packet()
    };
    engine.inject(TrafficLayer::OutboundTransportV4, &plain);
    engine.inject(TrafficLayer::OutboundTransportV4, &vxlan_packet());
    engine.inject(TrafficLayer::OutboundTransportV4, &vxlan_packet());

    let snap = filter.stats().snapshot();
    assert_eq!(snap.passed_through, 1);
    assert_eq!(snap.classified, 2);
    assert_eq!(snap.redirected, 2);
    assert_eq!(snap.context_creates, 1);
    assert_eq!(snap.provision_cycles, 1);
}
