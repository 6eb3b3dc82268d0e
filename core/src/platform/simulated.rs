//! Scriptable in-process BLE stack
//!
//! Behaves like a native stack from the session's point of view: calls
//! return immediately, link state changes are reported through the event
//! sink. Every native call is counted so tests can assert on what the session
//! actually asked the hardware to do.
//!
//! Two modes:
//! - manual (default): nothing happens on its own; the test drives scan
//!   results, link transitions and prompt outcomes
//! - automatic: advertising devices are reported when a scan starts and
//!   connectable devices walk through `Connecting -> Connected` on connect

use super::{
    HandleId, LeScannerSupport, NativeDevice, NativeHandle, NativeRadio, PermissionProvider,
    PermissionScope, PermissionStatus, PlatformEventSink, RadioCapabilities, RequestTag, ScanApi,
};
use crate::device::{device_type, ConnectionState};
use crate::error::RadioError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How a simulated prompt (permission or power-on) resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptBehavior {
    /// Prompt stays open until the test resolves it
    #[default]
    Manual,
    Accept,
    Decline,
    /// The prompt cannot be shown at all
    Unsupported,
}

/// Native calls issued by the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeCalls {
    pub start_scan: usize,
    pub stop_scan: usize,
    pub connect: usize,
    pub reconnect: usize,
    pub disconnect: usize,
    pub close: usize,
    pub request_enable: usize,
}

/// A peripheral known to the simulated stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDevice {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_device_type")]
    pub device_type: i32,
    #[serde(default)]
    pub bonded: bool,
    #[serde(default = "default_true")]
    pub connectable: bool,
    #[serde(default = "default_true")]
    pub advertising: bool,
}

fn default_device_type() -> i32 {
    device_type::LE
}

fn default_true() -> bool {
    true
}

impl SimulatedDevice {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
            device_type: device_type::LE,
            bonded: false,
            connectable: true,
            advertising: true,
        }
    }

    pub fn bonded(mut self) -> Self {
        self.bonded = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.connectable = false;
        self
    }

    pub fn native(&self) -> NativeDevice {
        NativeDevice {
            id: self.id.clone(),
            name: self.name.clone(),
            device_type: self.device_type,
        }
    }
}

struct SimLink {
    device: NativeDevice,
    state: ConnectionState,
}

struct RadioState {
    platform: String,
    capabilities: RadioCapabilities,
    available: bool,
    enabled: bool,
    devices: Vec<SimulatedDevice>,
    sink: Option<PlatformEventSink>,
    scanning: bool,
    scan_api: Option<ScanApi>,
    links: HashMap<HandleId, SimLink>,
    next_handle: u64,
    calls: NativeCalls,
    auto: bool,
    refuse_reconnect: bool,
    fail_connect: bool,
    fail_disconnect: bool,
    enable_prompt: PromptBehavior,
    enable_requests: Vec<RequestTag>,
}

impl RadioState {
    fn device(&self, id: &str) -> Option<&SimulatedDevice> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn connectable(&self, id: &str) -> bool {
        self.device(id).map(|d| d.connectable).unwrap_or(false)
    }

    /// Move a link to `state` and collect the callback to deliver.
    fn transition(
        &mut self,
        handle: HandleId,
        state: ConnectionState,
        out: &mut Vec<(HandleId, NativeDevice, ConnectionState)>,
    ) {
        if let Some(link) = self.links.get_mut(&handle) {
            link.state = state;
            out.push((handle, link.device.clone(), state));
        }
    }
}

/// Simulated native radio.
#[derive(Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<RadioState>>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    /// Available, powered on, modern scanner, manual mode, no devices.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState {
                platform: "Simulated".to_string(),
                capabilities: RadioCapabilities::default(),
                available: true,
                enabled: true,
                devices: Vec::new(),
                sink: None,
                scanning: false,
                scan_api: None,
                links: HashMap::new(),
                next_handle: 1,
                calls: NativeCalls::default(),
                auto: false,
                refuse_reconnect: false,
                fail_connect: false,
                fail_disconnect: false,
                enable_prompt: PromptBehavior::Manual,
                enable_requests: Vec::new(),
            })),
        }
    }

    pub fn with_platform_name(self, name: &str) -> Self {
        self.state.lock().platform = name.to_string();
        self
    }

    pub fn with_scanner(self, support: LeScannerSupport) -> Self {
        self.state.lock().capabilities.le_scanner = support;
        self
    }

    pub fn with_device(self, device: SimulatedDevice) -> Self {
        self.state.lock().devices.push(device);
        self
    }

    pub fn with_devices(self, devices: impl IntoIterator<Item = SimulatedDevice>) -> Self {
        self.state.lock().devices.extend(devices);
        self
    }

    pub fn with_enable_prompt(self, prompt: PromptBehavior) -> Self {
        self.state.lock().enable_prompt = prompt;
        self
    }

    /// Switch to automatic mode.
    pub fn automatic(self) -> Self {
        self.state.lock().auto = true;
        self
    }

    pub fn unavailable(self) -> Self {
        self.state.lock().available = false;
        self
    }

    pub fn powered_off(self) -> Self {
        self.state.lock().enabled = false;
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn set_refuse_reconnect(&self, refuse: bool) {
        self.state.lock().refuse_reconnect = refuse;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Make `disconnect` refuse, leaving the link as it is.
    pub fn set_fail_disconnect(&self, fail: bool) {
        self.state.lock().fail_disconnect = fail;
    }

    pub fn calls(&self) -> NativeCalls {
        self.state.lock().calls.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    /// Scan API used by the most recent `start_scan`.
    pub fn scan_api(&self) -> Option<ScanApi> {
        self.state.lock().scan_api
    }

    pub fn enable_requests(&self) -> Vec<RequestTag> {
        self.state.lock().enable_requests.clone()
    }

    /// Connection objects not yet closed.
    pub fn open_links(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Report an advertisement, as the native scan callback would.
    pub fn advertise(&self, device: NativeDevice) {
        let sink = self.state.lock().sink.clone();
        if let Some(sink) = sink {
            sink.scan_result(device);
        }
    }

    /// Report a native scan failure.
    pub fn fail_scan(&self, code: i32) {
        let sink = {
            let mut state = self.state.lock();
            state.scanning = false;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.scan_failed(code);
        }
    }

    /// Drive every open link of `device_id` to `state` and report it.
    pub fn set_link_state(&self, device_id: &str, state: ConnectionState) {
        let (sink, events) = {
            let mut radio = self.state.lock();
            let mut handles: Vec<HandleId> = radio
                .links
                .iter()
                .filter(|(_, link)| link.device.id == device_id)
                .map(|(handle, _)| *handle)
                .collect();
            handles.sort();
            let mut events = Vec::new();
            for handle in handles {
                radio.transition(handle, state, &mut events);
            }
            (radio.sink.clone(), events)
        };
        if let Some(sink) = sink {
            for (handle, device, state) in events {
                sink.connection_state(handle, device, state);
            }
        }
    }

    /// Resolve an open power-on prompt.
    pub fn resolve_enable(&self, tag: RequestTag, enabled: bool) {
        let sink = {
            let mut state = self.state.lock();
            if enabled {
                state.enabled = true;
            }
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.enable_result(tag, enabled);
        }
    }

    fn deliver(&self, sink: Option<PlatformEventSink>, events: Vec<(HandleId, NativeDevice, ConnectionState)>) {
        if let Some(sink) = sink {
            for (handle, device, state) in events {
                sink.connection_state(handle, device, state);
            }
        }
    }
}

#[async_trait]
impl NativeRadio for SimulatedRadio {
    fn platform_name(&self) -> String {
        self.state.lock().platform.clone()
    }

    fn capabilities(&self) -> RadioCapabilities {
        self.state.lock().capabilities
    }

    fn attach(&self, sink: PlatformEventSink) {
        self.state.lock().sink = Some(sink);
    }

    async fn is_available(&self) -> bool {
        self.state.lock().available
    }

    async fn is_enabled(&self) -> bool {
        let state = self.state.lock();
        state.available && state.enabled
    }

    async fn request_enable(&self, tag: RequestTag) -> Result<(), RadioError> {
        let (prompt, sink) = {
            let mut state = self.state.lock();
            state.calls.request_enable += 1;
            state.enable_requests.push(tag);
            if state.enable_prompt == PromptBehavior::Accept {
                state.enabled = true;
            }
            (state.enable_prompt, state.sink.clone())
        };
        match (prompt, sink) {
            (PromptBehavior::Unsupported, _) => Err(RadioError::Unsupported(
                "enable prompt".to_string(),
            )),
            (PromptBehavior::Accept, Some(sink)) => {
                sink.enable_result(tag, true);
                Ok(())
            }
            (PromptBehavior::Decline, Some(sink)) => {
                sink.enable_result(tag, false);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn start_scan(&self, api: ScanApi) -> Result<(), RadioError> {
        let (sink, advertised) = {
            let mut state = self.state.lock();
            state.calls.start_scan += 1;
            state.scanning = true;
            state.scan_api = Some(api);
            let advertised: Vec<NativeDevice> = if state.auto {
                state
                    .devices
                    .iter()
                    .filter(|d| d.advertising)
                    .map(SimulatedDevice::native)
                    .collect()
            } else {
                Vec::new()
            };
            (state.sink.clone(), advertised)
        };
        if let Some(sink) = sink {
            for device in advertised {
                sink.scan_result(device);
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        state.calls.stop_scan += 1;
        state.scanning = false;
        Ok(())
    }

    async fn resolve_device(&self, id: &str) -> Option<NativeDevice> {
        self.state.lock().device(id).map(SimulatedDevice::native)
    }

    async fn bonded_devices(&self) -> Result<Vec<NativeDevice>, RadioError> {
        let state = self.state.lock();
        if !state.capabilities.bonded_devices {
            return Ok(Vec::new());
        }
        Ok(state
            .devices
            .iter()
            .filter(|d| d.bonded)
            .map(SimulatedDevice::native)
            .collect())
    }

    async fn connect(
        &self,
        device: &NativeDevice,
        _auto_reconnect: bool,
    ) -> Result<NativeHandle, RadioError> {
        let (handle, sink, events) = {
            let mut state = self.state.lock();
            state.calls.connect += 1;
            if state.fail_connect {
                return Err(RadioError::Failed("connectGatt returned null".to_string()));
            }

            let handle = HandleId(state.next_handle);
            state.next_handle += 1;
            state.links.insert(
                handle,
                SimLink {
                    device: device.clone(),
                    state: ConnectionState::Disconnected,
                },
            );

            let mut events = Vec::new();
            state.transition(handle, ConnectionState::Connecting, &mut events);
            if !state.auto {
                // Manual mode: the attempt stays pending silently
                events.clear();
            } else if state.connectable(&device.id) {
                state.transition(handle, ConnectionState::Connected, &mut events);
            }
            (handle, state.sink.clone(), events)
        };
        self.deliver(sink, events);
        Ok(NativeHandle::new(handle, device.id.clone()))
    }

    async fn reconnect(&self, handle: &NativeHandle) -> Result<(), RadioError> {
        let (sink, events) = {
            let mut state = self.state.lock();
            state.calls.reconnect += 1;
            if state.refuse_reconnect || !state.links.contains_key(&handle.id()) {
                return Err(RadioError::Refused);
            }
            let mut events = Vec::new();
            state.transition(handle.id(), ConnectionState::Connecting, &mut events);
            if !state.auto {
                events.clear();
            } else if state.connectable(handle.device_id()) {
                state.transition(handle.id(), ConnectionState::Connected, &mut events);
            }
            (state.sink.clone(), events)
        };
        self.deliver(sink, events);
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
        let (sink, events) = {
            let mut state = self.state.lock();
            state.calls.disconnect += 1;
            if state.fail_disconnect {
                return Err(RadioError::Refused);
            }
            let current = match state.links.get(&handle.id()) {
                Some(link) => link.state,
                None => return Ok(()),
            };
            let mut events = Vec::new();
            if current != ConnectionState::Disconnected {
                if state.auto {
                    state.transition(handle.id(), ConnectionState::Disconnecting, &mut events);
                    state.transition(handle.id(), ConnectionState::Disconnected, &mut events);
                } else if let Some(link) = state.links.get_mut(&handle.id()) {
                    // Manual mode: teardown pending until the test finishes it
                    link.state = ConnectionState::Disconnecting;
                }
            }
            (state.sink.clone(), events)
        };
        self.deliver(sink, events);
        Ok(())
    }

    async fn close(&self, handle: NativeHandle) {
        let mut state = self.state.lock();
        state.calls.close += 1;
        state.links.remove(&handle.id());
    }
}

// ============================================================================
// PERMISSIONS
// ============================================================================

struct PermissionState {
    granted: bool,
    prompt: PromptBehavior,
    requests: Vec<(Vec<PermissionScope>, RequestTag)>,
    sink: Option<PlatformEventSink>,
}

/// Simulated runtime permission model.
#[derive(Clone)]
pub struct SimulatedPermissions {
    state: Arc<Mutex<PermissionState>>,
}

impl SimulatedPermissions {
    pub fn granted() -> Self {
        Self::with_state(true)
    }

    pub fn denied() -> Self {
        Self::with_state(false)
    }

    fn with_state(granted: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(PermissionState {
                granted,
                prompt: PromptBehavior::Manual,
                requests: Vec::new(),
                sink: None,
            })),
        }
    }

    pub fn with_prompt(self, prompt: PromptBehavior) -> Self {
        self.state.lock().prompt = prompt;
        self
    }

    pub fn set_granted(&self, granted: bool) {
        self.state.lock().granted = granted;
    }

    /// Tags of every prompt shown so far.
    pub fn requests(&self) -> Vec<RequestTag> {
        self.state.lock().requests.iter().map(|(_, tag)| *tag).collect()
    }

    /// Scopes asked for by the most recent prompt.
    pub fn last_requested_scopes(&self) -> Option<Vec<PermissionScope>> {
        self.state.lock().requests.last().map(|(scopes, _)| scopes.clone())
    }

    /// Resolve an open permission prompt.
    pub fn resolve(&self, tag: RequestTag, granted: bool) {
        let sink = {
            let mut state = self.state.lock();
            state.granted = granted;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.permission_result(tag, granted);
        }
    }
}

#[async_trait]
impl PermissionProvider for SimulatedPermissions {
    fn attach(&self, sink: PlatformEventSink) {
        self.state.lock().sink = Some(sink);
    }

    async fn check(&self, _scopes: &[PermissionScope]) -> PermissionStatus {
        if self.state.lock().granted {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        }
    }

    async fn request(
        &self,
        scopes: &[PermissionScope],
        tag: RequestTag,
    ) -> Result<(), RadioError> {
        let (prompt, sink) = {
            let mut state = self.state.lock();
            state.requests.push((scopes.to_vec(), tag));
            if state.prompt == PromptBehavior::Accept {
                state.granted = true;
            }
            (state.prompt, state.sink.clone())
        };
        match (prompt, sink) {
            (PromptBehavior::Unsupported, _) => Err(RadioError::Unsupported(
                "permission prompt".to_string(),
            )),
            (PromptBehavior::Accept, Some(sink)) => {
                sink.permission_result(tag, true);
                Ok(())
            }
            (PromptBehavior::Decline, Some(sink)) => {
                sink.permission_result(tag, false);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
