//! Native collaborator interfaces
//!
//! The session never talks to a Bluetooth stack directly. Platform code
//! provides a [`NativeRadio`] (scan, connect, power state) and a
//! [`PermissionProvider`] (runtime permission model), and reports everything
//! asynchronous (scan results, link state changes, prompt outcomes) through a
//! single [`PlatformEventSink`]. The session drains that sink on the same
//! task that processes commands, so callbacks never race registry updates.
//!
//! Two stacks ship with the crate:
//!
//! - **simulated**: scriptable in-process stack used by tests and the CLI
//! - **desktop**: `btleplug` backed stack (feature `desktop`)

pub mod simulated;

#[cfg(feature = "desktop")]
pub mod desktop;

use crate::device::{ConnectionState, DeviceRecord};
use crate::error::RadioError;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

pub use simulated::{
    NativeCalls, PromptBehavior, SimulatedDevice, SimulatedPermissions, SimulatedRadio,
};

#[cfg(feature = "desktop")]
pub use desktop::DesktopRadio;

// ============================================================================
// HANDLES & DEVICES
// ============================================================================

/// Identity of a native connection object, used to route callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Ownership of a native connection object (`BluetoothGatt`, `CBPeripheral`
/// link, ...).
///
/// Not `Clone`: [`NativeRadio::close`] consumes it, so a handle can only be
/// released once.
#[derive(Debug, PartialEq, Eq)]
pub struct NativeHandle {
    id: HandleId,
    device_id: String,
}

impl NativeHandle {
    pub fn new(id: HandleId, device_id: impl Into<String>) -> Self {
        Self {
            id,
            device_id: device_id.into(),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// A device as resolved or observed by the native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDevice {
    pub id: String,
    pub name: Option<String>,
    pub device_type: i32,
}

impl NativeDevice {
    pub fn new(id: impl Into<String>, name: Option<&str>, device_type: i32) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
            device_type,
        }
    }

    pub fn to_record(&self, state: ConnectionState) -> DeviceRecord {
        DeviceRecord::new(self.id.clone(), self.name.clone(), self.device_type).with_state(state)
    }
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Which LE scanning API the stack offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeScannerSupport {
    /// Dedicated scanner object with scan settings (Android 5+, CoreBluetooth, BlueZ)
    Modern,
    /// Adapter-level LE scan only (pre-Lollipop Android)
    Legacy,
    /// The platform should expose a scanner but currently does not
    Missing,
}

/// Scan API selected for a session after probing capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanApi {
    LowLatencyScanner,
    LegacyLeScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioCapabilities {
    pub le_scanner: LeScannerSupport,
    /// Host can enumerate bonded devices
    pub bonded_devices: bool,
}

impl RadioCapabilities {
    pub fn scan_api(&self) -> Option<ScanApi> {
        match self.le_scanner {
            LeScannerSupport::Modern => Some(ScanApi::LowLatencyScanner),
            LeScannerSupport::Legacy => Some(ScanApi::LegacyLeScan),
            LeScannerSupport::Missing => None,
        }
    }
}

impl Default for RadioCapabilities {
    fn default() -> Self {
        Self {
            le_scanner: LeScannerSupport::Modern,
            bonded_devices: true,
        }
    }
}

// ============================================================================
// PERMISSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionScope {
    FineLocation,
    BluetoothScan,
    BluetoothConnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Key under which a suspended operation waits for a prompt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestTag(pub u32);

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

/// Everything a platform reports asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    ScanResult(NativeDevice),
    ScanFailed {
        code: i32,
    },
    ConnectionStateChanged {
        handle: HandleId,
        device: NativeDevice,
        state: ConnectionState,
    },
    PermissionResult {
        tag: RequestTag,
        granted: bool,
    },
    EnableResult {
        tag: RequestTag,
        enabled: bool,
    },
}

/// Sending half of the session's platform event bus.
///
/// Cheap to clone; callable from any thread. Events sent after the session
/// shut down are dropped.
#[derive(Debug, Clone)]
pub struct PlatformEventSink {
    tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl PlatformEventSink {
    pub fn new(tx: mpsc::UnboundedSender<PlatformEvent>) -> Self {
        Self { tx }
    }

    pub fn scan_result(&self, device: NativeDevice) {
        self.send(PlatformEvent::ScanResult(device));
    }

    pub fn scan_failed(&self, code: i32) {
        self.send(PlatformEvent::ScanFailed { code });
    }

    pub fn connection_state(&self, handle: HandleId, device: NativeDevice, state: ConnectionState) {
        self.send(PlatformEvent::ConnectionStateChanged {
            handle,
            device,
            state,
        });
    }

    pub fn permission_result(&self, tag: RequestTag, granted: bool) {
        self.send(PlatformEvent::PermissionResult { tag, granted });
    }

    pub fn enable_result(&self, tag: RequestTag, enabled: bool) {
        self.send(PlatformEvent::EnableResult { tag, enabled });
    }

    pub fn send(&self, event: PlatformEvent) {
        if self.tx.send(event).is_err() {
            debug!("Platform event dropped: session closed");
        }
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Native BLE central capability.
///
/// Implementations wrap the platform stack; calls are made from the session
/// task one at a time. Anything the stack reports later goes through the
/// sink handed over in [`NativeRadio::attach`].
#[async_trait]
pub trait NativeRadio: Send + Sync {
    /// Label reported by `getPlatformName`
    fn platform_name(&self) -> String;

    fn capabilities(&self) -> RadioCapabilities;

    /// Called once when the session starts
    fn attach(&self, sink: PlatformEventSink);

    async fn is_available(&self) -> bool;

    async fn is_enabled(&self) -> bool;

    /// Show the power-on prompt; the outcome arrives as
    /// [`PlatformEvent::EnableResult`] with the same tag.
    async fn request_enable(&self, tag: RequestTag) -> Result<(), RadioError>;

    async fn start_scan(&self, api: ScanApi) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    async fn resolve_device(&self, id: &str) -> Option<NativeDevice>;

    async fn bonded_devices(&self) -> Result<Vec<NativeDevice>, RadioError>;

    async fn connect(
        &self,
        device: &NativeDevice,
        auto_reconnect: bool,
    ) -> Result<NativeHandle, RadioError>;

    /// Reuse an existing connection object
    async fn reconnect(&self, handle: &NativeHandle) -> Result<(), RadioError>;

    async fn connection_state(&self, handle: &NativeHandle) -> ConnectionState;

    async fn disconnect(&self, handle: &NativeHandle) -> Result<(), RadioError>;

    /// Release the connection object. No callbacks follow for this handle.
    async fn close(&self, handle: NativeHandle);
}

/// Runtime permission model of the host.
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Called once when the session starts; providers that resolve prompts
    /// on their own report outcomes here.
    fn attach(&self, _sink: PlatformEventSink) {}

    async fn check(&self, scopes: &[PermissionScope]) -> PermissionStatus;

    /// Show the permission prompt; the outcome arrives as
    /// [`PlatformEvent::PermissionResult`] with the same tag.
    async fn request(&self, scopes: &[PermissionScope], tag: RequestTag)
        -> Result<(), RadioError>;
}

/// Hosts without runtime permissions (desktop, CoreBluetooth folds
/// authorization into the adapter state).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRuntimePermissions;

#[async_trait]
impl PermissionProvider for NoRuntimePermissions {
    async fn check(&self, _scopes: &[PermissionScope]) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn request(
        &self,
        _scopes: &[PermissionScope],
        _tag: RequestTag,
    ) -> Result<(), RadioError> {
        Err(RadioError::Unsupported(
            "no runtime permission prompt".to_string(),
        ))
    }
}
