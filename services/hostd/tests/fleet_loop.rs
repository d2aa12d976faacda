//! End-to-end tests: a real fleet manager driving a real hostd acceptor
//! over loopback QUIC, with the mock runtime behind the RPC surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use podnet_fleet::{FleetError, FleetManager};
use podnet_hostd::{Acceptor, MockRuntime};
use podnet_rpc::PodHandler;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const LOOPBACK_ANY: &str = "127.0.0.1:0";

/// Bind an acceptor and spawn its accept loop, retrying briefly so a test
/// can rebind the address a previous acceptor just released.
async fn spawn_acceptor(addr: SocketAddr, runtime: Arc<MockRuntime>) -> Arc<Acceptor> {
    let mut last_err = None;
    for _ in 0..50 {
        match Acceptor::bind(addr, runtime.clone(), Duration::from_secs(5)) {
            Ok(acceptor) => {
                let acceptor = Arc::new(acceptor);
                let accept_loop = Arc::clone(&acceptor);
                tokio::spawn(async move { accept_loop.run().await });
                return acceptor;
            }
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    panic!("failed to bind acceptor on {addr}: {last_err:?}");
}

async fn start_host() -> (Arc<Acceptor>, Arc<MockRuntime>, SocketAddr) {
    let runtime = Arc::new(MockRuntime::new());
    let acceptor = spawn_acceptor(LOOPBACK_ANY.parse().unwrap(), runtime.clone()).await;
    let addr = acceptor.local_addr().unwrap();
    (acceptor, runtime, addr)
}

#[tokio::test]
async fn create_start_stop_lifecycle() {
    let (_acceptor, _runtime, addr) = start_host().await;

    let fleet = FleetManager::new();
    fleet.add("h1", &addr.to_string()).await.unwrap();

    let pod_id = fleet
        .add_new_pod_to_host("h1", "web", "alpine", vec!["sleep".into()], HashMap::new())
        .await
        .unwrap();

    let snapshot = fleet.inspect_pod_by_id(&pod_id).await.unwrap();
    assert_eq!(snapshot.state.status, "created");
    assert!(!snapshot.state.running);

    fleet.start_pod_by_id(&pod_id, None).await.unwrap();
    let snapshot = fleet.inspect_pod_by_id(&pod_id).await.unwrap();
    assert!(snapshot.state.running);
    assert_eq!(snapshot.path, "sleep");

    fleet.stop_pod_by_id(&pod_id, None).await.unwrap();
    let snapshot = fleet.inspect_pod_by_id(&pod_id).await.unwrap();
    assert!(!snapshot.state.running);
    assert_eq!(snapshot.state.exit_code, 0);
}

#[tokio::test]
async fn remote_errors_stay_in_band() {
    let (_acceptor, _runtime, addr) = start_host().await;

    let fleet = FleetManager::new();
    fleet.add("h1", &addr.to_string()).await.unwrap();

    let pod_id = fleet
        .add_new_pod_to_host("h1", "web", "alpine", vec![], HashMap::new())
        .await
        .unwrap();

    // Stopping a pod that never started is an application error; the stream
    // must survive it and serve the next call.
    let err = fleet.stop_pod_by_id(&pod_id, None).await.unwrap_err();
    assert!(!err.is_network());
    assert!(err.to_string().contains("not running"));

    fleet.start_pod_by_id(&pod_id, None).await.unwrap();
    assert!(fleet.inspect_pod_by_id(&pod_id).await.unwrap().state.running);
}

#[tokio::test]
async fn attach_echoes_and_pod_stays_controllable() {
    let (_acceptor, _runtime, addr) = start_host().await;

    let fleet = FleetManager::new();
    fleet.add("h1", &addr.to_string()).await.unwrap();

    let pod_id = fleet
        .add_new_pod_to_host("h1", "web", "alpine", vec![], HashMap::new())
        .await
        .unwrap();
    fleet.start_pod_by_id(&pod_id, None).await.unwrap();

    let mut raw = fleet.attach_pod_by_id(&pod_id).await.unwrap();

    raw.writer.write_all(b"hello pod").await.unwrap();
    raw.writer.flush().await.unwrap();

    let mut echoed = [0u8; 9];
    raw.reader.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello pod");

    // The attach consumed the pod's old stream; the fleet rebinds it, so
    // control calls keep working while the raw session is live.
    let snapshot = fleet.inspect_pod_by_id(&pod_id).await.unwrap();
    assert!(snapshot.state.running);

    fleet.kill_pod_by_id(&pod_id, None).await.unwrap();
    let snapshot = fleet.inspect_pod_by_id(&pod_id).await.unwrap();
    assert_eq!(snapshot.state.exit_code, 137);
}

#[tokio::test]
async fn explicit_reconnect_rebinds_pods() {
    let (_acceptor, _runtime, addr) = start_host().await;

    let fleet = FleetManager::new();
    fleet.add("h1", &addr.to_string()).await.unwrap();

    let pod_id = fleet
        .add_new_pod_to_host("h1", "web", "alpine", vec![], HashMap::new())
        .await
        .unwrap();

    let host = fleet.host("h1").unwrap();
    host.reconnect().await.unwrap();

    // The pod rides the fresh connection transparently.
    fleet.start_pod_by_id(&pod_id, None).await.unwrap();
    assert!(fleet.inspect_pod_by_id(&pod_id).await.unwrap().state.running);
}

#[tokio::test]
async fn host_restart_heals_on_second_call() {
    let (acceptor1, runtime, addr) = start_host().await;

    let fleet = FleetManager::new();
    fleet.add("h1", &addr.to_string()).await.unwrap();

    let pod_id = fleet
        .add_new_pod_to_host("h1", "web", "alpine", vec![], HashMap::new())
        .await
        .unwrap();

    // Kill the host process, then bring it back on the same address with
    // its pod table intact.
    acceptor1.close().await;
    drop(acceptor1);
    let _acceptor2 = spawn_acceptor(addr, runtime).await;

    // First call rides the dead connection and fails; the failure queues a
    // reconnect that completes before the error is returned.
    let err = fleet.start_pod_by_id(&pod_id, None).await.unwrap_err();
    assert!(err.is_network(), "expected network error, got: {err}");

    // Second call lands on the rebound stream.
    fleet.start_pod_by_id(&pod_id, None).await.unwrap();
    assert!(fleet.inspect_pod_by_id(&pod_id).await.unwrap().state.running);
}

#[tokio::test]
async fn offline_registration_binds_on_reconnect() {
    // Reserve an address nothing listens on yet.
    let placeholder = tokio::net::UdpSocket::bind(LOOPBACK_ANY).await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let fleet = FleetManager::new();

    // Registration survives the failed initial dial.
    let err = fleet.add("h1", &addr.to_string()).await.unwrap_err();
    assert!(err.is_network(), "expected network error, got: {err}");
    assert!(fleet.host("h1").is_some());

    // Reconcile a stored pod record while the host is still down.
    let runtime = Arc::new(MockRuntime::new());
    let pod_id = runtime
        .create("web", "alpine", &[], &HashMap::new())
        .await
        .unwrap();
    fleet
        .add_existing_pod_to_host_without_connect("h1", &pod_id)
        .await
        .unwrap();

    let err = fleet.inspect_pod_by_id(&pod_id).await.unwrap_err();
    assert!(err.is_network());

    // Host comes up; an explicit reconnect binds the pod.
    let _acceptor = spawn_acceptor(addr, runtime).await;
    fleet.host("h1").unwrap().reconnect().await.unwrap();

    let snapshot = fleet.inspect_pod_by_id(&pod_id).await.unwrap();
    assert_eq!(snapshot.id, pod_id);
    assert_eq!(snapshot.state.status, "created");
}

#[tokio::test]
async fn delete_pod_removes_it_everywhere() {
    let (_acceptor, runtime, addr) = start_host().await;

    let fleet = FleetManager::new();
    fleet.add("h1", &addr.to_string()).await.unwrap();

    let pod_id = fleet
        .add_new_pod_to_host("h1", "web", "alpine", vec![], HashMap::new())
        .await
        .unwrap();
    fleet.start_pod_by_id(&pod_id, None).await.unwrap();

    fleet.delete_pod_by_id(&pod_id, None).await.unwrap();

    let err = fleet.start_pod_by_id(&pod_id, None).await.unwrap_err();
    assert!(matches!(err, FleetError::NoSuchPod(_)));

    // Gone from the host's runtime too, not just the registry.
    assert!(runtime.inspect(&pod_id).await.is_err());
}

#[tokio::test]
async fn two_hosts_resolve_pods_independently() {
    let (_a1, _r1, addr1) = start_host().await;
    let (_a2, _r2, addr2) = start_host().await;

    let fleet = FleetManager::new();
    fleet.add("h1", &addr1.to_string()).await.unwrap();
    fleet.add("h2", &addr2.to_string()).await.unwrap();

    let p1 = fleet
        .add_new_pod_to_host("h1", "web", "alpine", vec![], HashMap::new())
        .await
        .unwrap();
    let p2 = fleet
        .add_new_pod_to_host("h2", "db", "postgres", vec![], HashMap::new())
        .await
        .unwrap();

    fleet.start_pod_by_id(&p1, None).await.unwrap();
    assert!(fleet.inspect_pod_by_id(&p1).await.unwrap().state.running);
    assert!(!fleet.inspect_pod_by_id(&p2).await.unwrap().state.running);

    // Removing one host must not disturb the other's pods.
    fleet.remove("h1").await;
    let err = fleet.inspect_pod_by_id(&p1).await.unwrap_err();
    assert!(matches!(err, FleetError::NoSuchPod(_)));
    assert_eq!(fleet.inspect_pod_by_id(&p2).await.unwrap().name, "db");
}
