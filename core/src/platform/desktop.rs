//! btleplug backed stack for desktop hosts (BlueZ, CoreBluetooth, WinRT).
//!
//! Desktop hosts have no runtime permission prompts and no way to power the
//! radio on programmatically, so pair this radio with
//! [`super::NoRuntimePermissions`]. btleplug reports adapter events on a
//! stream; a listener task forwards them to the session sink.

use super::{
    HandleId, LeScannerSupport, NativeDevice, NativeHandle, NativeRadio, PlatformEventSink,
    RadioCapabilities, RequestTag, ScanApi,
};
use crate::device::{device_type, ConnectionState};
use crate::error::RadioError;
use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

struct Link {
    peer: PeripheralId,
    peripheral: Peripheral,
    device: NativeDevice,
    state: ConnectionState,
    dial: DialTask,
}

/// In-flight `peripheral.connect()` of a link, aborted when replaced or when
/// the link is dropped on close.
#[derive(Default)]
struct DialTask(Option<JoinHandle<()>>);

impl DialTask {
    fn replace(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.0.replace(task) {
            previous.abort();
        }
    }
}

impl Drop for DialTask {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct DesktopState {
    sink: Option<PlatformEventSink>,
    links: HashMap<HandleId, Link>,
    next_handle: u64,
    listener: Option<JoinHandle<()>>,
}

pub struct DesktopRadio {
    adapter: Adapter,
    state: Arc<Mutex<DesktopState>>,
}

fn radio_error(e: btleplug::Error) -> RadioError {
    RadioError::Failed(e.to_string())
}

/// Device id: MAC address where the host exposes one, otherwise the
/// platform peripheral id (CoreBluetooth hides addresses).
fn peripheral_key(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}

async fn describe(peripheral: &Peripheral) -> NativeDevice {
    let name = match peripheral.properties().await {
        Ok(Some(properties)) => properties.local_name,
        Ok(None) => None,
        Err(e) => {
            debug!("No properties for {}: {}", peripheral_key(peripheral), e);
            None
        }
    };
    NativeDevice {
        id: peripheral_key(peripheral),
        name,
        device_type: device_type::LE,
    }
}

/// Move a link to `next`, reporting it only if the state actually changed.
fn transition(state: &Mutex<DesktopState>, handle: HandleId, next: ConnectionState) {
    let update = {
        let mut guard = state.lock();
        let sink = guard.sink.clone();
        match guard.links.get_mut(&handle) {
            Some(link) if link.state != next => {
                link.state = next;
                sink.map(|sink| (sink, link.device.clone()))
            }
            _ => None,
        }
    };
    if let Some((sink, device)) = update {
        sink.connection_state(handle, device, next);
    }
}

fn transition_peer(state: &Mutex<DesktopState>, peer: &PeripheralId, next: ConnectionState) {
    let handles: Vec<HandleId> = state
        .lock()
        .links
        .iter()
        .filter(|(_, link)| &link.peer == peer)
        .map(|(handle, _)| *handle)
        .collect();
    for handle in handles {
        transition(state, handle, next);
    }
}

impl DesktopRadio {
    /// Open the first adapter the host reports.
    pub async fn new() -> Result<Self, RadioError> {
        let manager = Manager::new().await.map_err(radio_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(radio_error)?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Unsupported("no Bluetooth adapter found".to_string()))?;
        Ok(Self::with_adapter(adapter))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            state: Arc::new(Mutex::new(DesktopState {
                next_handle: 1,
                ..Default::default()
            })),
        }
    }

    async fn find(&self, id: &str) -> Result<Option<Peripheral>, RadioError> {
        let peripherals = self.adapter.peripherals().await.map_err(radio_error)?;
        Ok(peripherals
            .into_iter()
            .find(|peripheral| peripheral_key(peripheral).eq_ignore_ascii_case(id)))
    }

    fn spawn_listener(&self, sink: PlatformEventSink) -> JoinHandle<()> {
        let adapter = self.adapter.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to subscribe to adapter events: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if let Ok(peripheral) = adapter.peripheral(&id).await {
                            sink.scan_result(describe(&peripheral).await);
                        }
                    }
                    CentralEvent::DeviceConnected(id) => {
                        transition_peer(&state, &id, ConnectionState::Connected)
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        transition_peer(&state, &id, ConnectionState::Disconnected)
                    }
                    _ => {}
                }
            }
            debug!("Adapter event stream ended");
        })
    }

    fn dial(&self, handle: HandleId, peripheral: Peripheral) {
        transition(&self.state, handle, ConnectionState::Connecting);
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => transition(&state, handle, ConnectionState::Connected),
                Err(e) => {
                    warn!("Connect through {} failed: {}", handle, e);
                    transition(&state, handle, ConnectionState::Disconnected);
                }
            }
        });

        let mut guard = self.state.lock();
        match guard.links.get_mut(&handle) {
            Some(link) => link.dial.replace(task),
            // closed while the task was being spawned
            None => task.abort(),
        }
    }
}

impl Drop for DesktopRadio {
    fn drop(&mut self) {
        if let Some(listener) = self.state.lock().listener.take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl NativeRadio for DesktopRadio {
    fn platform_name(&self) -> String {
        match std::env::consts::OS {
            "linux" => "Linux".to_string(),
            "macos" => "macOS".to_string(),
            "windows" => "Windows".to_string(),
            other => other.to_string(),
        }
    }

    fn capabilities(&self) -> RadioCapabilities {
        RadioCapabilities {
            le_scanner: LeScannerSupport::Modern,
            bonded_devices: false,
        }
    }

    fn attach(&self, sink: PlatformEventSink) {
        let listener = self.spawn_listener(sink.clone());
        let mut state = self.state.lock();
        state.sink = Some(sink);
        if let Some(previous) = state.listener.replace(listener) {
            previous.abort();
        }
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn is_enabled(&self) -> bool {
        self.adapter.adapter_info().await.is_ok()
    }

    async fn request_enable(&self, _tag: RequestTag) -> Result<(), RadioError> {
        Err(RadioError::Unsupported(
            "desktop hosts cannot power the adapter on".to_string(),
        ))
    }

    async fn start_scan(&self, _api: ScanApi) -> Result<(), RadioError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(radio_error)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await.map_err(radio_error)
    }

    async fn resolve_device(&self, id: &str) -> Option<NativeDevice> {
        match self.find(id).await {
            Ok(Some(peripheral)) => Some(describe(&peripheral).await),
            Ok(None) => None,
            Err(e) => {
                warn!("Peripheral lookup failed: {}", e);
                None
            }
        }
    }

    async fn bonded_devices(&self) -> Result<Vec<NativeDevice>, RadioError> {
        // btleplug has no bond enumeration
        Ok(Vec::new())
    }

    async fn connect(
        &self,
        device: &NativeDevice,
        auto_reconnect: bool,
    ) -> Result<NativeHandle, RadioError> {
        let peripheral = self
            .find(&device.id)
            .await?
            .ok_or_else(|| RadioError::Failed(format!("{} is not known to the adapter", device.id)))?;
        if auto_reconnect {
            debug!("Background reconnection is not available on desktop hosts");
        }

        let handle = {
            let mut state = self.state.lock();
            let handle = HandleId(state.next_handle);
            state.next_handle += 1;
            state.links.insert(
                handle,
                Link {
                    peer: peripheral.id(),
                    peripheral: peripheral.clone(),
                    device: device.clone(),
                    state: ConnectionState::Disconnected,
                    dial: DialTask::default(),
                },
            );
            handle
        };
        self.dial(handle, peripheral);
        Ok(NativeHandle::new(handle, device.id.clone()))
    }

    async fn reconnect(&self, handle: &NativeHandle) -> Result<(), RadioError> {
        let peripheral = self
            .state
            .lock()
            .links
            .get(&handle.id())
            .map(|link| link.peripheral.clone())
            .ok_or(RadioError::Refused)?;
        self.dial(handle.id(), peripheral);
        Ok(())
    }

    async fn connection_state(&self, handle: &NativeHandle) -> ConnectionState {
        self.state
            .lock()
            .links
            .get(&handle.id())
            .map(|link| link.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    async fn disconnect(&self, handle: &NativeHandle) -> Result<(), RadioError> {
        let peripheral = {
            let state = self.state.lock();
            match state.links.get(&handle.id()) {
                Some(link) if link.state != ConnectionState::Disconnected => {
                    link.peripheral.clone()
                }
                _ => return Ok(()),
            }
        };
        transition(&self.state, handle.id(), ConnectionState::Disconnecting);

        let state = self.state.clone();
        let id = handle.id();
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect through {} failed: {}", id, e);
            }
            transition(&state, id, ConnectionState::Disconnected);
        });
        Ok(())
    }

    async fn close(&self, handle: NativeHandle) {
        // dropping the link aborts a dial still in flight
        self.state.lock().links.remove(&handle.id());
    }
}
