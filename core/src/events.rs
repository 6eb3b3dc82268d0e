//! Event Emitter
//!
//! Everything the session reports without being asked goes through one FIFO
//! channel, so events for a given device reach the caller in the order the
//! native stack produced them. Delivery is fire-and-forget: no
//! acknowledgement, no backpressure.

use crate::device::{DeviceRecord, WireDevice};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Events pushed to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A named device was seen during a scan (`onScanResult`)
    ScanResult(DeviceRecord),
    /// The scan window closed (`onStopScan`); `explicit` is false when it ran out
    StopScan { explicit: bool },
    /// A device changed link state (`onDeviceState`)
    DeviceState(DeviceRecord),
}

impl SessionEvent {
    /// Bridge method name for this event.
    pub fn method(&self) -> &'static str {
        match self {
            SessionEvent::ScanResult(_) => "onScanResult",
            SessionEvent::StopScan { .. } => "onStopScan",
            SessionEvent::DeviceState(_) => "onDeviceState",
        }
    }

    /// Bridge payload for this event.
    pub fn payload(&self) -> Value {
        match self {
            SessionEvent::ScanResult(record) => wire_value(record.to_wire()),
            SessionEvent::StopScan { explicit } => Value::Bool(*explicit),
            SessionEvent::DeviceState(record) => wire_value(record.to_wire_with_state()),
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            SessionEvent::ScanResult(record) | SessionEvent::DeviceState(record) => {
                Some(&record.id)
            }
            SessionEvent::StopScan { .. } => None,
        }
    }
}

fn wire_value(device: WireDevice) -> Value {
    // WireDevice is plain strings and integers
    serde_json::to_value(device).unwrap_or(Value::Null)
}

/// Sending side, owned by the session.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventEmitter {
    pub fn channel() -> (EventEmitter, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventEmitter { tx }, EventStream { rx })
    }

    pub fn emit(&self, event: SessionEvent) {
        debug!("emit {}", event.method());
        if self.tx.send(event).is_err() {
            debug!("Event dropped: no listener");
        }
    }

    pub fn scan_result(&self, record: DeviceRecord) {
        self.emit(SessionEvent::ScanResult(record));
    }

    pub fn stop_scan(&self, explicit: bool) {
        self.emit(SessionEvent::StopScan { explicit });
    }

    pub fn device_state(&self, record: DeviceRecord) {
        self.emit(SessionEvent::DeviceState(record));
    }
}

/// Receiving side, handed to the caller.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    /// Next event; `None` once the session has shut down and the queue is drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
