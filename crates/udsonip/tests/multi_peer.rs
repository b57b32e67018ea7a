//! Multi-peer access through one shared bridge
//!
//! Several named ECUs sit behind one mock gateway; tests drive them through
//! a `PeerRegistry` from one or many tasks and inspect what the gateway saw.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use udsonip::transport::mock::{MockEcu, MockGateway};
use udsonip::{
    BridgeOptions, ConnectionBridge, ConnectionState, DiagnosticServices, LogicalAddress,
    PeerRegistry, ServiceRequest, UdsCodec, UdsOnIpError,
};

const ENGINE: LogicalAddress = LogicalAddress::new(0x00E0);
const TRANSMISSION: LogicalAddress = LogicalAddress::new(0x00E1);
const BODY: LogicalAddress = LogicalAddress::new(0x00E2);

fn vin_reply(vin: &[u8; 17]) -> Vec<u8> {
    let mut reply = vec![0x62, 0xF1, 0x90];
    reply.extend_from_slice(vin);
    reply
}

fn registry_with(gateway: &Arc<MockGateway>) -> Arc<PeerRegistry> {
    let options = BridgeOptions {
        request_timeout: Duration::from_millis(200),
        ..BridgeOptions::default()
    };
    let bridge = ConnectionBridge::new(gateway.clone(), Arc::new(UdsCodec), options);
    let registry = PeerRegistry::new(Arc::new(bridge));
    registry.register("engine", ENGINE).unwrap();
    registry.register("transmission", TRANSMISSION).unwrap();
    registry.register("body", BODY).unwrap();
    Arc::new(registry)
}

fn vehicle() -> Arc<MockGateway> {
    let gateway = MockGateway::new();
    gateway.add_ecu(
        ENGINE,
        MockEcu::new().respond(vec![0x22, 0xF1, 0x90], vin_reply(b"ENGINE00000000001")),
    );
    gateway.add_ecu(
        TRANSMISSION,
        MockEcu::new().respond(vec![0x22, 0xF1, 0x90], vin_reply(b"TRANSMISSION00002")),
    );
    gateway.add_ecu(BODY, MockEcu::silent());
    gateway
}

#[tokio::test]
async fn test_scopes_route_to_named_peers() {
    let gateway = vehicle();
    let registry = registry_with(&gateway);

    let engine = registry.scope("engine").await.unwrap();
    assert_eq!(registry.bridge().current_target(), Some(ENGINE));
    assert_eq!(
        engine.read_data_by_identifier(0xF190).await.unwrap(),
        b"ENGINE00000000001".to_vec()
    );
    engine.release().unwrap();

    let transmission = registry.scope("transmission").await.unwrap();
    assert_eq!(registry.bridge().current_target(), Some(TRANSMISSION));
    assert_eq!(
        transmission.read_data_by_identifier(0xF190).await.unwrap(),
        b"TRANSMISSION00002".to_vec()
    );
    transmission.release().unwrap();

    assert_eq!(gateway.sent_targets(), vec![ENGINE, TRANSMISSION]);
    assert_eq!(gateway.reconnect_calls(), 0);
}

#[tokio::test]
async fn test_silent_peer_inside_scope_times_out_and_frees_bridge() {
    let gateway = vehicle();
    let registry = registry_with(&gateway);

    let started = std::time::Instant::now();
    {
        let body = registry.scope("body").await.unwrap();
        let err = body
            .request(&ServiceRequest::new(0x3E, vec![0x00]), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        assert_eq!(registry.bridge().state(), ConnectionState::Busy);
    }
    assert!(started.elapsed() >= Duration::from_millis(45));
    assert_eq!(registry.bridge().state(), ConnectionState::Idle);
    assert_eq!(registry.bridge().current_target(), None);
}

#[tokio::test]
async fn test_scope_restores_target_on_error_path() {
    let gateway = vehicle();
    let registry = registry_with(&gateway);
    registry.bridge().retarget(ENGINE).await.unwrap();

    async fn read_body_vin(registry: &PeerRegistry) -> udsonip::Result<Vec<u8>> {
        let body = registry.scope("body").await?;
        body.read_data_by_identifier(0xF190).await
    }

    let err = read_body_vin(&registry).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(registry.bridge().current_target(), Some(ENGINE));
    assert_eq!(registry.bridge().state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    let gateway = vehicle();
    let registry = registry_with(&gateway);
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let holder = registry.scope("engine").await.unwrap();

    let mut handles = Vec::new();
    for name in ["transmission", "body", "engine"] {
        let registry = registry.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let scope = registry.scope(name).await.unwrap();
            order.lock().push(name);
            scope.release().unwrap();
        }));
        // Let each contender reach the lock before the next one starts
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    holder.release().unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock(), vec!["transmission", "body", "engine"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    const TASKS: usize = 8;
    const ROUNDS: usize = 5;

    let gateway = MockGateway::with_latency(Duration::from_millis(1));
    gateway.add_ecu(ENGINE, MockEcu::new());
    gateway.add_ecu(TRANSMISSION, MockEcu::new());
    let registry = registry_with(&gateway);
    registry.bridge().retarget(BODY).await.unwrap();

    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for task in 0..TASKS {
        let registry = registry.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        handles.push(tokio::spawn(async move {
            let name = if task % 2 == 0 { "engine" } else { "transmission" };
            for _ in 0..ROUNDS {
                let scope = registry
                    .scope_with_timeout(name, Duration::from_secs(10))
                    .await
                    .unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);

                assert_eq!(registry.bridge().current_target(), Some(scope.address()));
                scope.tester_present(false).await.unwrap();
                tokio::task::yield_now().await;
                scope.tester_present(false).await.unwrap();

                inside.fetch_sub(1, Ordering::SeqCst);
                scope.release().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(registry.bridge().current_target(), Some(BODY));
    assert_eq!(registry.bridge().state(), ConnectionState::Idle);

    // Each scope sent two frames back to back; no pair was interleaved
    let targets = gateway.sent_targets();
    assert_eq!(targets.len(), TASKS * ROUNDS * 2);
    for pair in targets.chunks(2) {
        assert_eq!(pair[0], pair[1]);
    }
}

#[tokio::test]
async fn test_direct_request_waits_for_scope() {
    let gateway = vehicle();
    let registry = registry_with(&gateway);
    registry.bridge().retarget(ENGINE).await.unwrap();

    let scope = registry.scope("transmission").await.unwrap();
    let contender = registry.clone();
    let direct = tokio::spawn(async move {
        contender
            .bridge()
            .request(&ServiceRequest::new(0x3E, vec![0x00]), Duration::from_millis(500))
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    scope
        .request(&ServiceRequest::new(0x3E, vec![0x00]), Duration::from_millis(100))
        .await
        .unwrap();
    scope.release().unwrap();

    direct.await.unwrap().unwrap();
    assert_eq!(gateway.sent_targets(), vec![TRANSMISSION, ENGINE]);
}

#[tokio::test]
async fn test_removed_peer_is_unknown() {
    let gateway = vehicle();
    let registry = registry_with(&gateway);
    registry.remove("body");

    let err = registry.scope("body").await.unwrap_err();
    assert!(matches!(err, UdsOnIpError::UnknownPeer(_)));
    assert_eq!(registry.bridge().state(), ConnectionState::Idle);
}
