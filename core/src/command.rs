//! Typed command surface
//!
//! The bridge decodes method calls into [`Command`]s and hands each one to
//! the session together with a [`ReplySlot`]. The slot completes exactly
//! once: completing consumes it.

use crate::device::DeviceRecord;
use crate::error::BleError;
use crate::session::gate::Operation;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// Commands accepted from the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetPlatformName,
    IsAvailable,
    IsEnabled,
    /// `None` uses the configured default period
    Scan { period_ms: Option<i64> },
    Paired,
    Connect {
        address: Option<String>,
        timeout_ms: Option<i64>,
    },
    Disconnect { address: Option<String> },
}

impl Command {
    /// Bridge method name.
    pub fn method(&self) -> &'static str {
        match self {
            Command::GetPlatformName => "getPlatformName",
            Command::IsAvailable => "isAvailable",
            Command::IsEnabled => "isEnabled",
            Command::Scan { .. } => "scan",
            Command::Paired => "paired",
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
        }
    }

    /// Operation checked by the adapter gate; `None` for plain queries.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Command::GetPlatformName | Command::IsAvailable | Command::IsEnabled => None,
            Command::Scan { .. } => Some(Operation::Scan),
            Command::Paired => Some(Operation::Paired),
            Command::Connect { .. } => Some(Operation::Connect),
            Command::Disconnect { .. } => Some(Operation::Disconnect),
        }
    }
}

/// Successful command results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    PlatformName(String),
    Flag(bool),
    /// Request accepted; the outcome arrives as events
    Ack,
    Devices(Vec<DeviceRecord>),
}

impl Response {
    /// Bridge payload for this result.
    pub fn to_value(&self) -> Value {
        match self {
            Response::PlatformName(name) => Value::String(name.clone()),
            Response::Flag(flag) => Value::Bool(*flag),
            Response::Ack => Value::Null,
            Response::Devices(devices) => Value::Array(
                devices
                    .iter()
                    .map(|d| serde_json::to_value(d.to_wire()).unwrap_or(Value::Null))
                    .collect(),
            ),
        }
    }
}

pub type CommandResult = Result<Response, BleError>;

/// Pending result of one command.
#[derive(Debug)]
pub struct ReplySlot {
    method: &'static str,
    tx: oneshot::Sender<CommandResult>,
}

impl ReplySlot {
    pub fn channel(method: &'static str) -> (ReplySlot, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (ReplySlot { method, tx }, rx)
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn complete(self, result: CommandResult) {
        match &result {
            Ok(_) => debug!("{} completed", self.method),
            Err(e) => debug!("{} failed: {} ({})", self.method, e, e.code()),
        }
        if self.tx.send(result).is_err() {
            debug!("{} result dropped: caller went away", self.method);
        }
    }

    pub fn succeed(self, response: Response) {
        self.complete(Ok(response));
    }

    pub fn fail(self, error: BleError) {
        self.complete(Err(error));
    }
}

/// A command waiting for the session, together with its reply slot.
#[derive(Debug)]
pub struct PendingCommand {
    pub command: Command,
    pub reply: ReplySlot,
}

impl PendingCommand {
    pub fn new(command: Command) -> (PendingCommand, oneshot::Receiver<CommandResult>) {
        let (reply, rx) = ReplySlot::channel(command.method());
        (PendingCommand { command, reply }, rx)
    }
}
