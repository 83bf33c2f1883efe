//! End-to-end tests for the HV500 device server: requests flow through the
//! command channel, wire traffic goes to a scripted transport, and backend
//! availability events drive reconnection.

use rust_devctl::config::DeviceConfig;
use rust_devctl::device::LinkState;
use rust_devctl::discovery::MemoryDirectory;
use rust_devctl::error::{ConnectionError, DeviceError, ProtocolError};
use rust_devctl::registry::{MemoryRegistry, PORT_NAMESPACE};
use rust_devctl::server::{Hv500Handle, Hv500Server};
use rust_devctl::transport::{MockBackend, MockTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const NODE: &str = "labnode";
const REG_KEY: &str = "HV500_HV264";

fn device_config() -> DeviceConfig {
    DeviceConfig {
        name: "hv500".to_string(),
        reg_key: Some(REG_KEY.to_string()),
        node: Some(NODE.to_string()),
        timeout: Duration::from_millis(100),
        baud_rate: Some(9600),
    }
}

fn registry_with_port() -> Arc<MemoryRegistry> {
    let registry = MemoryRegistry::new();
    registry.set(&["", PORT_NAMESPACE], REG_KEY, "COM3");
    Arc::new(registry)
}

/// Script the initial 16-channel refresh performed on connect.
fn script_refresh(transport: &MockTransport) {
    for _ in 0..16 {
        transport.push_response("0.00V\r\n");
    }
}

struct Harness {
    backend: Arc<MockBackend>,
    transport: MockTransport,
    directory: Arc<MemoryDirectory>,
    handle: Hv500Handle,
    task: JoinHandle<()>,
}

/// Spawn a server that connects at startup through a scripted transport.
fn connected_harness() -> Harness {
    let backend = Arc::new(MockBackend::new(NODE));
    let transport = MockTransport::new();
    script_refresh(&transport);
    backend.push_transport(transport.clone());

    let directory = Arc::new(MemoryDirectory::new());
    let (handle, task) = Hv500Server::spawn(
        device_config(),
        registry_with_port(),
        backend.clone(),
        directory.as_ref(),
    );

    Harness {
        backend,
        transport,
        directory,
        handle,
        task,
    }
}

async fn wait_for_state(handle: &Hv500Handle, wanted: LinkState) {
    for _ in 0..50 {
        if handle.link_state().await.unwrap() == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never reached {wanted:?}");
}

#[tokio::test]
async fn test_get_identity_round_trip() {
    let harness = connected_harness();
    harness.transport.push_response("HV264 500 16 b\r\n");

    let identity = harness.handle.get_identity().await.unwrap();
    assert_eq!(identity, "HV264 500 16 b");
    assert!(harness.transport.written().contains(&"IDN\r".to_string()));
}

#[tokio::test]
async fn test_get_voltage_round_trip() {
    let harness = connected_harness();
    harness.transport.push_response("12.50V\r\n");

    let volts = harness.handle.get_voltage(3).await.unwrap();
    assert!((volts - 12.5).abs() < 1e-9);
    assert!(harness
        .transport
        .written()
        .contains(&"HV264 Q03\r".to_string()));
}

#[tokio::test]
async fn test_set_voltage_writes_encoded_line() {
    let harness = connected_harness();
    wait_for_state(&harness.handle, LinkState::Connected).await;
    let writes_before = harness.transport.write_count();

    harness.handle.set_voltage(16, -150.0).await.unwrap();
    let written = harness.transport.written();
    assert_eq!(written.len(), writes_before + 1);
    assert_eq!(written.last().unwrap(), "HV264 CH16 0.350000\r");
}

#[tokio::test]
async fn test_set_voltage_out_of_bounds_writes_nothing() {
    let harness = connected_harness();
    wait_for_state(&harness.handle, LinkState::Connected).await;
    let writes_before = harness.transport.write_count();

    for volts in [300.0001, -300.0001, 1.0e6] {
        let err = harness.handle.set_voltage(1, volts).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Protocol(ProtocolError::OutOfBounds { .. })
        ));
    }
    assert_eq!(harness.transport.write_count(), writes_before);

    // The boundary itself is accepted.
    harness.handle.set_voltage(1, 300.0).await.unwrap();
    harness.handle.set_voltage(1, -300.0).await.unwrap();
    assert_eq!(harness.transport.write_count(), writes_before + 2);
}

#[tokio::test]
async fn test_get_voltage_bad_channel_no_transport_access() {
    let harness = connected_harness();
    wait_for_state(&harness.handle, LinkState::Connected).await;
    let writes_before = harness.transport.write_count();

    for channel in [0, 17, 255] {
        let err = harness.handle.get_voltage(channel).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Protocol(ProtocolError::ChannelOutOfRange { .. })
        ));
    }
    assert_eq!(harness.transport.write_count(), writes_before);
}

#[tokio::test]
async fn test_starts_disconnected_without_backend_server() {
    // Empty backend queue: the serial server is not advertised.
    let backend = Arc::new(MockBackend::new(NODE));
    let directory = Arc::new(MemoryDirectory::new());
    let (handle, _task) = Hv500Server::spawn(
        device_config(),
        registry_with_port(),
        backend,
        directory.as_ref(),
    );

    wait_for_state(&handle, LinkState::Disconnected).await;
    let err = handle.get_voltage(1).await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::Connection(ConnectionError::NotConnected)
    ));
}

#[tokio::test]
async fn test_starts_disconnected_with_unconfigured_registry() {
    let backend = Arc::new(MockBackend::new(NODE));
    backend.push_transport(MockTransport::new());
    let directory = Arc::new(MemoryDirectory::new());
    let (handle, _task) = Hv500Server::spawn(
        device_config(),
        Arc::new(MemoryRegistry::new()),
        backend.clone(),
        directory.as_ref(),
    );

    wait_for_state(&handle, LinkState::Disconnected).await;
    // Port never resolved, so no open was attempted.
    assert_eq!(backend.open_count(), 0);
}

#[tokio::test]
async fn test_missing_attributes_stops_the_server() {
    let mut config = device_config();
    config.node = None;
    let backend = Arc::new(MockBackend::new(NODE));
    let directory = Arc::new(MemoryDirectory::new());
    let (handle, task) = Hv500Server::spawn(
        config,
        registry_with_port(),
        backend,
        directory.as_ref(),
    );

    task.await.unwrap();
    let err = handle.get_identity().await.unwrap_err();
    assert!(matches!(err, DeviceError::ServerStopped));
}

#[tokio::test]
async fn test_rebinds_when_backend_comes_online() {
    // Start with no backend server available.
    let backend = Arc::new(MockBackend::new(NODE));
    let directory = Arc::new(MemoryDirectory::new());
    let (handle, _task) = Hv500Server::spawn(
        device_config(),
        registry_with_port(),
        backend.clone(),
        directory.as_ref(),
    );
    wait_for_state(&handle, LinkState::Disconnected).await;

    // The serial server for this node comes online.
    let transport = MockTransport::new();
    script_refresh(&transport);
    transport.push_response("7.30V\r\n");
    backend.push_transport(transport.clone());
    directory.register(&format!("{NODE} Serial Server"));

    wait_for_state(&handle, LinkState::Connected).await;
    let volts = handle.get_voltage(2).await.unwrap();
    assert!((volts - 7.3).abs() < 1e-9);
}

#[tokio::test]
async fn test_ignores_availability_of_other_nodes() {
    let backend = Arc::new(MockBackend::new(NODE));
    let directory = Arc::new(MemoryDirectory::new());
    let (handle, _task) = Hv500Server::spawn(
        device_config(),
        registry_with_port(),
        backend.clone(),
        directory.as_ref(),
    );
    wait_for_state(&handle, LinkState::Disconnected).await;

    backend.push_transport(MockTransport::new());
    directory.register("othernode Serial Server");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.link_state().await.unwrap(), LinkState::Disconnected);
    // Only the startup attempt: the event did not trigger an open.
    assert_eq!(backend.open_count(), 1);
}

#[tokio::test]
async fn test_disconnects_only_on_matching_identity() {
    let harness = connected_harness();
    wait_for_state(&harness.handle, LinkState::Connected).await;

    // An unrelated service going away must not drop the connection.
    let unrelated = harness.directory.register("othernode Serial Server");
    harness.directory.deregister(unrelated.id);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.handle.link_state().await.unwrap(),
        LinkState::Connected
    );

    // A disconnect carrying the held handle's identity must.
    harness.directory.deregister(harness.backend.identity());
    wait_for_state(&harness.handle, LinkState::Disconnected).await;

    let err = harness.handle.get_voltage(1).await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::Connection(ConnectionError::NotConnected)
    ));
}

#[tokio::test]
async fn test_transport_failure_invalidates_connection() {
    let harness = connected_harness();
    wait_for_state(&harness.handle, LinkState::Connected).await;

    harness.transport.fail_io();
    let err = harness.handle.get_voltage(1).await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::Connection(ConnectionError::NotConnected)
    ));
    assert_eq!(
        harness.handle.link_state().await.unwrap(),
        LinkState::Disconnected
    );
}

#[tokio::test]
async fn test_subscribers_receive_voltage_updates() {
    let harness = connected_harness();
    wait_for_state(&harness.handle, LinkState::Connected).await;

    let mut subscription = harness.handle.subscribe().await.unwrap();

    harness.transport.push_response("42.00V\r\n");
    harness.handle.get_voltage(5).await.unwrap();

    let update = tokio::time::timeout(Duration::from_secs(1), subscription.updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.channel, 5);
    assert!((update.volts - 42.0).abs() < 1e-9);

    assert!(harness.handle.unsubscribe(subscription.id).await.unwrap());
    assert!(!harness.handle.unsubscribe(subscription.id).await.unwrap());
}

#[tokio::test]
async fn test_shutdown_closes_connection() {
    let harness = connected_harness();
    wait_for_state(&harness.handle, LinkState::Connected).await;

    harness.handle.shutdown().await.unwrap();
    harness.task.await.unwrap();

    let err = harness.handle.get_identity().await.unwrap_err();
    assert!(matches!(err, DeviceError::ServerStopped));
}
