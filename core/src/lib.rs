// bleprint core: BLE central session manager
//
// Discover peripherals, connect and disconnect them, and report every
// link change back to the caller. Platform stacks plug in underneath
// through the traits in `platform`.

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod platform;
pub mod session;

pub use command::{Command, CommandResult, Response};
pub use config::{ConfigError, SessionConfig};
pub use device::{device_type, ConnectionState, DeviceRecord, WireDevice};
pub use error::{BleError, RadioError};
pub use events::{EventStream, SessionEvent};
pub use platform::{
    NativeRadio, NoRuntimePermissions, PermissionProvider, PlatformEventSink, RequestTag,
};
pub use session::{BleSession, Operation, PromptKind, SessionHandle};
