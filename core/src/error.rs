//! Error taxonomy for the session manager.
//!
//! Every failure a command can complete with is a [`BleError`]. Each variant
//! carries a stable wire code (see [`BleError::code`]) that the bridge hands
//! back to the caller unchanged.

use thiserror::Error;

/// Errors a command can complete with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    // Preflight
    #[error("Bluetooth is unavailable")]
    Unavailable,
    #[error("is required location permissions")]
    NoPermissions,
    #[error("is required Bluetooth enable")]
    BluetoothDisabled,
    #[error("BluetoothLeScanner is unavailable")]
    ScannerUnavailable,

    // Address errors
    #[error("address cannot be null")]
    AddressNull,
    #[error("the device address is not found")]
    AddressNotFound,

    // Connection errors
    #[error("connection with device already exists")]
    AlreadyConnected,
    #[error("error when reconnecting to device")]
    ReconnectError,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("native radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("session is closed")]
    SessionClosed,
}

impl BleError {
    /// Wire error code reported to the caller.
    pub fn code(&self) -> &'static str {
        match self {
            BleError::Unavailable => "bluetooth_unavailable",
            BleError::NoPermissions => "no_permissions",
            BleError::BluetoothDisabled => "bluetooth_disabled",
            BleError::ScannerUnavailable => "bluetoothLe_scanner",
            BleError::AddressNull => "bluetooth_address_null",
            BleError::AddressNotFound => "bluetooth_address_not_found",
            BleError::AlreadyConnected => "already_connected",
            BleError::ReconnectError => "reconnect_error",
            BleError::InvalidArgument(_) => "invalid_argument",
            BleError::Radio(_) => "bluetooth_radio_error",
            BleError::SessionClosed => "session_closed",
        }
    }

    /// Preflight failures can be fixed by the user (grant, power on) and retried.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            BleError::Unavailable
                | BleError::NoPermissions
                | BleError::BluetoothDisabled
                | BleError::ScannerUnavailable
        )
    }
}

/// Failures reported by a native BLE stack or permission collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("operation not supported by this stack: {0}")]
    Unsupported(String),
    #[error("native call refused")]
    Refused,
    #[error("native call failed: {0}")]
    Failed(String),
}
