use bleprint_core::device::device_type;
use bleprint_core::platform::{
    LeScannerSupport, NativeDevice, ScanApi, SimulatedDevice, SimulatedPermissions, SimulatedRadio,
};
use bleprint_core::{BleError, BleSession, EventStream, SessionConfig, SessionEvent, SessionHandle};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn start(radio: &SimulatedRadio) -> (SessionHandle, EventStream) {
    start_with(radio, SessionConfig::default())
}

fn start_with(radio: &SimulatedRadio, config: SessionConfig) -> (SessionHandle, EventStream) {
    BleSession::spawn(
        Arc::new(radio.clone()),
        Arc::new(SimulatedPermissions::granted()),
        config,
    )
    .expect("valid config")
}

/// Round-trip a command so every callback queued before it has been handled.
async fn settle(handle: &SessionHandle) {
    handle.is_available().await.expect("session running");
}

fn printer(name: Option<&str>) -> NativeDevice {
    NativeDevice::new("AA:BB:CC:DD:EE:01", name, device_type::LE)
}

fn scan_results(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ScanResult(_)))
        .count()
}

fn stops(events: &[SessionEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StopScan { explicit } => Some(*explicit),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_scan_while_unavailable_never_reaches_radio() {
    let radio = SimulatedRadio::new().unavailable();
    let (handle, mut events) = start(&radio);

    assert_eq!(handle.scan(Some(2000)).await, Err(BleError::Unavailable));
    assert_eq!(radio.calls().start_scan, 0);
    assert!(!radio.is_scanning());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(events.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_discoveries_then_single_timeout_stop() {
    let radio = SimulatedRadio::new();
    let (handle, mut events) = start(&radio);

    handle.scan(Some(2000)).await.unwrap();
    assert!(radio.is_scanning());

    radio.advertise(printer(Some("X")));
    tokio::time::sleep(Duration::from_millis(10)).await;
    radio.advertise(printer(Some("X")));
    settle(&handle).await;

    tokio::time::sleep(Duration::from_millis(1970)).await;
    let before = events.drain();
    assert_eq!(scan_results(&before), 2);
    assert!(stops(&before).is_empty());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let after = events.drain();
    assert_eq!(stops(&after), vec![false]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(events.drain().is_empty());
    assert!(!radio.is_scanning());
    assert_eq!(radio.calls().stop_scan, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_result_wire_shape() {
    let radio = SimulatedRadio::new();
    let (handle, mut events) = start(&radio);

    handle.scan(None).await.unwrap();
    radio.advertise(NativeDevice::new("AA:01", Some("Printer"), device_type::DUAL));
    settle(&handle).await;

    let event = events.try_recv().expect("scan result");
    assert_eq!(event.method(), "onScanResult");
    assert_eq!(
        event.payload(),
        serde_json::json!({"address": "AA:01", "name": "Printer", "type": 3})
    );
}

#[tokio::test(start_paused = true)]
async fn test_restart_stops_previous_scan_first() {
    let radio = SimulatedRadio::new();
    let (handle, mut events) = start(&radio);

    handle.scan(Some(2000)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    handle.scan(Some(2000)).await.unwrap();

    let calls = radio.calls();
    assert_eq!(calls.start_scan, 2);
    assert_eq!(calls.stop_scan, 1);
    assert_eq!(stops(&events.drain()), vec![true]);

    // The first window's timer died with it
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(stops(&events.drain()).is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(stops(&events.drain()), vec![false]);
    assert_eq!(radio.calls().stop_scan, 2);
}

#[tokio::test(start_paused = true)]
async fn test_restart_without_explicit_announcement() {
    let radio = SimulatedRadio::new();
    let config = SessionConfig {
        announce_explicit_stop: false,
        ..Default::default()
    };
    let (handle, mut events) = start_with(&radio, config);

    handle.scan(None).await.unwrap();
    handle.scan(None).await.unwrap();
    settle(&handle).await;
    assert!(events.drain().is_empty());
    assert_eq!(radio.calls().stop_scan, 1);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_outside_scan_dropped() {
    let radio = SimulatedRadio::new();
    let (handle, mut events) = start(&radio);

    radio.advertise(printer(Some("X")));
    settle(&handle).await;
    assert!(events.drain().is_empty());

    handle.scan(Some(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    events.drain();

    radio.advertise(printer(Some("X")));
    settle(&handle).await;
    assert!(events.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_scanner() {
    let radio = SimulatedRadio::new().with_scanner(LeScannerSupport::Missing);
    let (handle, _events) = start(&radio);

    let err = handle.scan(None).await.unwrap_err();
    assert_eq!(err, BleError::ScannerUnavailable);
    assert_eq!(err.code(), "bluetoothLe_scanner");
    assert_eq!(radio.calls().start_scan, 0);
}

#[tokio::test(start_paused = true)]
async fn test_legacy_scanner_selected_by_probe() {
    let radio = SimulatedRadio::new().with_scanner(LeScannerSupport::Legacy);
    let (handle, _events) = start(&radio);

    handle.scan(None).await.unwrap();
    assert_eq!(radio.scan_api(), Some(ScanApi::LegacyLeScan));
}

#[tokio::test(start_paused = true)]
async fn test_zero_period_stops_immediately() {
    let radio = SimulatedRadio::new();
    let (handle, mut events) = start(&radio);

    handle.scan(Some(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(stops(&events.drain()), vec![false]);
    assert!(!radio.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_negative_period_rejected() {
    let radio = SimulatedRadio::new();
    let (handle, _events) = start(&radio);

    let err = handle.scan(Some(-5)).await.unwrap_err();
    assert!(matches!(err, BleError::InvalidArgument(_)));
    assert_eq!(err.code(), "invalid_argument");
    assert_eq!(radio.calls().start_scan, 0);
}

#[tokio::test(start_paused = true)]
async fn test_default_period_from_config() {
    let radio = SimulatedRadio::new();
    let config = SessionConfig {
        default_scan_period_ms: 500,
        ..Default::default()
    };
    let (handle, mut events) = start_with(&radio, config);

    handle.scan(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(events.drain().is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stops(&events.drain()), vec![false]);
}

#[tokio::test(start_paused = true)]
async fn test_scan_failure_closes_window() {
    let radio = SimulatedRadio::new();
    let (handle, mut events) = start(&radio);

    handle.scan(Some(2000)).await.unwrap();
    radio.fail_scan(2);
    settle(&handle).await;
    assert_eq!(stops(&events.drain()), vec![false]);

    radio.advertise(printer(Some("X")));
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(events.drain().is_empty());
    // the stack stopped on its own
    assert_eq!(radio.calls().stop_scan, 0);
}

#[tokio::test(start_paused = true)]
async fn test_automatic_scan_reports_named_advertisers() {
    let radio = SimulatedRadio::new().automatic().with_devices([
        SimulatedDevice::new("AA", Some("Printer")),
        SimulatedDevice::new("BB", None),
        SimulatedDevice::new("CC", Some("")),
    ]);
    let (handle, mut events) = start(&radio);

    handle.scan(None).await.unwrap();
    settle(&handle).await;

    let reported: Vec<String> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::ScanResult(record) => Some(record.id),
            _ => None,
        })
        .collect();
    assert_eq!(reported, vec!["AA".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_paired_skips_nameless() {
    let radio = SimulatedRadio::new().with_devices([
        SimulatedDevice::new("AA", Some("Printer")).bonded(),
        SimulatedDevice::new("BB", None).bonded(),
        SimulatedDevice::new("CC", Some("Stranger")),
    ]);
    let (handle, _events) = start(&radio);

    let paired = handle.paired().await.unwrap();
    assert_eq!(paired.len(), 1);
    assert_eq!(paired[0].id, "AA");
    assert_eq!(paired[0].reportable_name(), Some("Printer"));
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn nameless_devices_never_reported(
        devices in prop::collection::vec((any::<bool>(), "[A-Za-z0-9 ]{0,6}"), 1..12)
    ) {
        let advertised: Vec<NativeDevice> = devices
            .iter()
            .enumerate()
            .map(|(i, (named, name))| {
                let name = if *named { Some(name.as_str()) } else { None };
                NativeDevice::new(format!("DEV-{}", i), name, device_type::LE)
            })
            .collect();
        let expected: Vec<String> = advertised
            .iter()
            .filter(|d| d.name.as_deref().map(|n| !n.is_empty()).unwrap_or(false))
            .map(|d| d.id.clone())
            .collect();

        let reported = runtime().block_on(async {
            let radio = SimulatedRadio::new();
            let (handle, mut events) = start(&radio);
            handle.scan(Some(1000)).await.expect("scan");
            for device in &advertised {
                radio.advertise(device.clone());
            }
            settle(&handle).await;
            events
                .drain()
                .into_iter()
                .filter_map(|e| match e {
                    SessionEvent::ScanResult(record) => Some(record.id),
                    _ => None,
                })
                .collect::<Vec<String>>()
        });

        prop_assert_eq!(reported, expected);
    }
}
