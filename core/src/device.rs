//! Device records and their wire shape

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport classification reported by the native stack.
pub mod device_type {
    pub const UNKNOWN: i32 = 0;
    pub const CLASSIC: i32 = 1;
    pub const LE: i32 = 2;
    pub const DUAL: i32 = 3;
}

/// Link state of a device.
///
/// Raw values match both native stacks (`BluetoothProfile.STATE_*` and
/// `CBPeripheralState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_raw(self) -> i32 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnecting => 3,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ConnectionState::Disconnected),
            1 => Some(ConnectionState::Connecting),
            2 => Some(ConnectionState::Connected),
            3 => Some(ConnectionState::Disconnecting),
            _ => None,
        }
    }

    /// True once the link is down and the handle may be released.
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Disconnected
    }
}

impl From<ConnectionState> for i32 {
    fn from(state: ConnectionState) -> Self {
        state.as_raw()
    }
}

impl TryFrom<i32> for ConnectionState {
    type Error = String;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        ConnectionState::from_raw(raw).ok_or_else(|| format!("unknown connection state {}", raw))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// A device as the caller sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Address (Android) or peripheral UUID (iOS); unique key
    pub id: String,
    /// `None` makes the device unreportable in discovery
    pub name: Option<String>,
    pub device_type: i32,
    pub connection_state: ConnectionState,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, name: Option<String>, device_type: i32) -> Self {
        Self {
            id: id.into(),
            name,
            device_type,
            connection_state: ConnectionState::Disconnected,
        }
    }

    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.connection_state = state;
        self
    }

    /// Name usable for a discovery report; empty names count as absent.
    pub fn reportable_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }

    /// Wire shape without `state` (scan results, paired list).
    pub fn to_wire(&self) -> WireDevice {
        WireDevice {
            address: self.id.clone(),
            name: self.name.clone().unwrap_or_default(),
            device_type: self.device_type,
            state: None,
        }
    }

    /// Wire shape carrying `state` (state-change events).
    pub fn to_wire_with_state(&self) -> WireDevice {
        WireDevice {
            state: Some(self.connection_state),
            ..self.to_wire()
        }
    }
}

/// `{address, name, type, state?}` as sent over the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDevice {
    pub address: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectionState>,
}
