use bleprint_core::device::ConnectionState;
use bleprint_core::platform::{SimulatedDevice, SimulatedPermissions, SimulatedRadio};
use bleprint_core::{
    BleError, BleSession, Command, EventStream, SessionConfig, SessionEvent, SessionHandle,
};
use std::sync::Arc;
use std::time::Duration;

const PRINTER: &str = "AA:BB:CC:DD:EE:01";

fn start(radio: &SimulatedRadio) -> (SessionHandle, EventStream) {
    BleSession::spawn(
        Arc::new(radio.clone()),
        Arc::new(SimulatedPermissions::granted()),
        SessionConfig::default(),
    )
    .expect("valid config")
}

async fn settle(handle: &SessionHandle) {
    handle.is_available().await.expect("session running");
}

fn manual_radio() -> SimulatedRadio {
    SimulatedRadio::new().with_device(SimulatedDevice::new(PRINTER, Some("Printer")))
}

fn auto_radio() -> SimulatedRadio {
    manual_radio().automatic()
}

fn states(events: &[SessionEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::DeviceState(record) => Some(record.connection_state),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_connect_acknowledges_and_reports_states() {
    let radio = auto_radio();
    let (handle, mut events) = start(&radio);

    handle.connect(PRINTER, Some(2000)).await.unwrap();
    settle(&handle).await;

    assert_eq!(
        states(&events.drain()),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    // Connected before the deadline: nothing is torn down
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(events.drain().is_empty());
    let calls = radio.calls();
    assert_eq!(calls.connect, 1);
    assert_eq!(calls.disconnect, 0);
    assert_eq!(calls.close, 0);
}

#[tokio::test(start_paused = true)]
async fn test_state_event_wire_shape() {
    let radio = auto_radio();
    let (handle, mut events) = start(&radio);

    handle.connect(PRINTER, None).await.unwrap();
    settle(&handle).await;

    let last = events.drain().pop().expect("state event");
    assert_eq!(last.method(), "onDeviceState");
    assert_eq!(
        last.payload(),
        serde_json::json!({"address": PRINTER, "name": "Printer", "type": 2, "state": 2})
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_already_connected() {
    let radio = auto_radio();
    let (handle, _events) = start(&radio);

    handle.connect(PRINTER, None).await.unwrap();
    settle(&handle).await;

    let err = handle.connect(PRINTER, None).await.unwrap_err();
    assert_eq!(err, BleError::AlreadyConnected);
    assert_eq!(err.code(), "already_connected");
    assert_eq!(radio.calls().connect, 1);
    assert_eq!(radio.calls().reconnect, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_tears_down_exactly_once() {
    let radio = manual_radio();
    let (handle, mut events) = start(&radio);

    handle.connect(PRINTER, Some(2000)).await.unwrap();
    assert_eq!(radio.open_links(), 1);

    tokio::time::sleep(Duration::from_millis(1900)).await;
    assert_eq!(radio.calls().close, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let calls = radio.calls();
    assert_eq!(calls.disconnect, 1);
    assert_eq!(calls.close, 1);
    assert_eq!(radio.open_links(), 0);
    assert_eq!(states(&events.drain()), vec![ConnectionState::Disconnected]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(events.drain().is_empty());
    assert_eq!(radio.calls().close, 1);

    // the entry is gone, so the next connect starts from scratch
    handle.connect(PRINTER, None).await.unwrap();
    assert_eq!(radio.calls().connect, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_attempt_reported_once_at_timeout() {
    let radio = manual_radio();
    let (handle, mut events) = start(&radio);

    handle.connect(PRINTER, Some(2000)).await.unwrap();
    radio.set_link_state(PRINTER, ConnectionState::Disconnected);
    settle(&handle).await;
    assert_eq!(states(&events.drain()), vec![ConnectionState::Disconnected]);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(events.drain().is_empty());
    let calls = radio.calls();
    assert_eq!(calls.disconnect, 0);
    assert_eq!(calls.close, 1);
    assert_eq!(radio.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connected_before_timeout_survives_timer() {
    let radio = manual_radio();
    let (handle, mut events) = start(&radio);

    handle.connect(PRINTER, Some(2000)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    radio.set_link_state(PRINTER, ConnectionState::Connected);
    settle(&handle).await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(states(&events.drain()), vec![ConnectionState::Connected]);
    assert_eq!(radio.calls().close, 0);
    assert_eq!(radio.open_links(), 1);

    assert_eq!(
        handle.connect(PRINTER, None).await,
        Err(BleError::AlreadyConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_then_disconnect_closes_once() {
    let radio = manual_radio();
    let (handle, mut events) = start(&radio);

    handle.connect(PRINTER, Some(2000)).await.unwrap();
    handle.disconnect(PRINTER).await.unwrap();

    // native teardown still pending: handle kept until Disconnected
    let calls = radio.calls();
    assert_eq!(calls.disconnect, 1);
    assert_eq!(calls.close, 0);
    assert_eq!(radio.open_links(), 1);

    radio.set_link_state(PRINTER, ConnectionState::Disconnected);
    settle(&handle).await;
    assert_eq!(radio.calls().close, 1);
    assert_eq!(radio.open_links(), 0);
    assert_eq!(states(&events.drain()), vec![ConnectionState::Disconnected]);

    // the connect timer left with the entry
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(events.drain().is_empty());
    let calls = radio.calls();
    assert_eq!(calls.disconnect, 1);
    assert_eq!(calls.close, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_connected_device() {
    let radio = auto_radio();
    let (handle, mut events) = start(&radio);

    handle.connect(PRINTER, None).await.unwrap();
    settle(&handle).await;
    events.drain();

    handle.disconnect(PRINTER).await.unwrap();
    settle(&handle).await;

    assert_eq!(
        states(&events.drain()),
        vec![ConnectionState::Disconnecting, ConnectionState::Disconnected]
    );
    assert_eq!(radio.calls().close, 1);
    assert_eq!(radio.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_removes_entry_while_native_pending() {
    let radio = manual_radio();
    let (handle, _events) = start(&radio);

    handle.connect(PRINTER, None).await.unwrap();
    radio.set_link_state(PRINTER, ConnectionState::Connected);
    settle(&handle).await;

    handle.disconnect(PRINTER).await.unwrap();
    assert_eq!(radio.calls().close, 0);

    // no AlreadyConnected and no reconnect: the registry forgot the device
    handle.connect(PRINTER, None).await.unwrap();
    let calls = radio.calls();
    assert_eq!(calls.connect, 2);
    assert_eq!(calls.reconnect, 0);
}

#[tokio::test(start_paused = true)]
async fn test_refused_disconnect_closes_handle() {
    let radio = manual_radio();
    let (handle, _events) = start(&radio);

    handle.connect(PRINTER, None).await.unwrap();
    radio.set_link_state(PRINTER, ConnectionState::Connected);
    settle(&handle).await;

    radio.set_fail_disconnect(true);
    handle.disconnect(PRINTER).await.unwrap();
    let calls = radio.calls();
    assert_eq!(calls.disconnect, 1);
    assert_eq!(calls.close, 1);
    assert_eq!(radio.open_links(), 0);

    radio.set_fail_disconnect(false);
    handle.connect(PRINTER, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(radio.calls().connect, 2);
    assert_eq!(radio.calls().close, 2);
    assert_eq!(radio.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_unknown_connection_is_ack() {
    let radio = manual_radio();
    let (handle, _events) = start(&radio);

    handle.disconnect(PRINTER).await.unwrap();
    let calls = radio.calls();
    assert_eq!(calls.disconnect, 0);
    assert_eq!(calls.close, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_handle_reconnects() {
    let radio = auto_radio();
    let (handle, mut events) = start(&radio);

    handle.connect(PRINTER, None).await.unwrap();
    settle(&handle).await;

    // the peripheral walks away on its own
    radio.set_link_state(PRINTER, ConnectionState::Disconnected);
    settle(&handle).await;
    assert_eq!(
        states(&events.drain()),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );
    assert_eq!(radio.open_links(), 1);

    handle.connect(PRINTER, None).await.unwrap();
    settle(&handle).await;
    let calls = radio.calls();
    assert_eq!(calls.connect, 1);
    assert_eq!(calls.reconnect, 1);
    assert_eq!(
        states(&events.drain()),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn test_refused_reconnect() {
    let radio = auto_radio();
    let (handle, _events) = start(&radio);

    handle.connect(PRINTER, None).await.unwrap();
    radio.set_link_state(PRINTER, ConnectionState::Disconnected);
    settle(&handle).await;

    radio.set_refuse_reconnect(true);
    let err = handle.connect(PRINTER, None).await.unwrap_err();
    assert_eq!(err, BleError::ReconnectError);
    assert_eq!(err.code(), "reconnect_error");
    assert_eq!(radio.calls().connect, 1);
}

#[tokio::test(start_paused = true)]
async fn test_address_errors() {
    let radio = manual_radio();
    let (handle, _events) = start(&radio);

    let missing = handle
        .execute(Command::Connect {
            address: None,
            timeout_ms: None,
        })
        .await;
    assert_eq!(missing, Err(BleError::AddressNull));

    assert_eq!(handle.connect("", None).await, Err(BleError::AddressNull));
    assert_eq!(
        handle.connect("00:00:00:00:00:00", None).await,
        Err(BleError::AddressNotFound)
    );
    assert_eq!(
        handle.execute(Command::Disconnect { address: None }).await,
        Err(BleError::AddressNull)
    );
    assert_eq!(
        handle.disconnect("nope").await.unwrap_err().code(),
        "bluetooth_address_not_found"
    );
    assert_eq!(radio.calls().connect, 0);
}

#[tokio::test(start_paused = true)]
async fn test_negative_timeout_rejected() {
    let radio = manual_radio();
    let (handle, _events) = start(&radio);

    assert!(matches!(
        handle.connect(PRINTER, Some(-1)).await,
        Err(BleError::InvalidArgument(_))
    ));
    assert_eq!(radio.calls().connect, 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_rejected() {
    let radio = manual_radio();
    let (handle, _events) = start(&radio);

    let err = handle.connect(PRINTER, Some(0)).await.unwrap_err();
    assert!(matches!(err, BleError::InvalidArgument(_)));
    assert_eq!(radio.calls().connect, 0);
}

#[tokio::test(start_paused = true)]
async fn test_native_connect_failure_leaves_no_entry() {
    let radio = manual_radio();
    let (handle, mut events) = start(&radio);

    radio.set_fail_connect(true);
    let err = handle.connect(PRINTER, None).await.unwrap_err();
    assert!(matches!(err, BleError::Radio(_)));
    assert_eq!(err.code(), "bluetooth_radio_error");

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(events.drain().is_empty());

    radio.set_fail_connect(false);
    handle.connect(PRINTER, None).await.unwrap();
    assert_eq!(radio.calls().connect, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_timer_spares_newer_attempt() {
    let radio = manual_radio();
    let (handle, _events) = start(&radio);

    handle.connect(PRINTER, Some(2000)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    handle.disconnect(PRINTER).await.unwrap();
    handle.connect(PRINTER, Some(2000)).await.unwrap();

    // first deadline passes without touching the second attempt
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(radio.calls().disconnect, 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(radio.calls().disconnect, 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_preempts_scan() {
    let radio = manual_radio();
    let (handle, mut events) = start(&radio);

    handle.scan(Some(5000)).await.unwrap();
    handle.connect(PRINTER, None).await.unwrap();

    assert!(!radio.is_scanning());
    assert_eq!(radio.calls().stop_scan, 1);
    assert_eq!(events.drain(), vec![SessionEvent::StopScan { explicit: true }]);
}

#[tokio::test(start_paused = true)]
async fn test_nameless_device_state_uses_empty_name() {
    let radio = SimulatedRadio::new()
        .automatic()
        .with_device(SimulatedDevice::new("1E4F", None));
    let (handle, mut events) = start(&radio);

    handle.connect("1E4F", None).await.unwrap();
    settle(&handle).await;

    let payloads: Vec<serde_json::Value> = events.drain().iter().map(|e| e.payload()).collect();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[1]["name"], "");
    assert_eq!(payloads[1]["state"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    let radio = auto_radio();
    let (handle, mut events) = start(&radio);

    handle.scan(None).await.unwrap();
    handle.connect(PRINTER, None).await.unwrap();
    settle(&handle).await;
    events.drain();

    handle.shutdown().await;
    assert!(handle.is_closed());
    let calls = radio.calls();
    assert_eq!(calls.disconnect, 1);
    assert_eq!(calls.close, 1);
    assert_eq!(radio.open_links(), 0);

    assert_eq!(handle.scan(None).await, Err(BleError::SessionClosed));
    assert_eq!(events.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_skips_disconnect_for_dropped_link() {
    let radio = auto_radio();
    let (handle, _events) = start(&radio);

    handle.connect(PRINTER, None).await.unwrap();
    radio.set_link_state(PRINTER, ConnectionState::Disconnected);
    settle(&handle).await;

    handle.shutdown().await;
    let calls = radio.calls();
    assert_eq!(calls.disconnect, 0);
    assert_eq!(calls.close, 1);
    assert_eq!(radio.open_links(), 0);
}
