//! Device Registry
//!
//! Plain mapping from device id to the native connection object the session
//! owns for it. No background work happens here; the connection timer lives
//! inside the attempt record and is cancelled when the record is dropped.
//!
//! Handles removed by a disconnect that has not completed yet are parked in
//! a separate release queue until the stack reports `Disconnected`.

use super::timer::ScopedTimer;
use crate::device::{ConnectionState, DeviceRecord};
use crate::platform::{HandleId, NativeDevice, NativeHandle};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Native connection object slot.
#[derive(Debug)]
pub enum HandleSlot {
    /// Registered before the native connect returned
    Pending,
    Established(NativeHandle),
}

/// A connection attempt with its timeout armed.
#[derive(Debug)]
pub struct ConnectionAttempt {
    pub number: u64,
    pub timeout: Duration,
    pub started_at: Instant,
    _timer: ScopedTimer,
}

impl ConnectionAttempt {
    pub fn new(number: u64, timeout: Duration, timer: ScopedTimer) -> Self {
        Self {
            number,
            timeout,
            started_at: Instant::now(),
            _timer: timer,
        }
    }
}

#[derive(Debug)]
pub struct RegistryEntry {
    pub device: NativeDevice,
    /// Last state reported by the stack
    pub state: ConnectionState,
    pub slot: HandleSlot,
    pub attempt: Option<ConnectionAttempt>,
}

impl RegistryEntry {
    /// Entry for a connect the session has just issued.
    pub fn pending(device: NativeDevice, attempt: ConnectionAttempt) -> Self {
        Self {
            device,
            state: ConnectionState::Connecting,
            slot: HandleSlot::Pending,
            attempt: Some(attempt),
        }
    }

    pub fn establish(&mut self, handle: NativeHandle) {
        self.slot = HandleSlot::Established(handle);
    }

    pub fn handle(&self) -> Option<&NativeHandle> {
        match &self.slot {
            HandleSlot::Established(handle) => Some(handle),
            HandleSlot::Pending => None,
        }
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        self.handle().map(NativeHandle::id)
    }

    pub fn into_handle(self) -> Option<NativeHandle> {
        match self.slot {
            HandleSlot::Established(handle) => Some(handle),
            HandleSlot::Pending => None,
        }
    }

    /// Connected, or a connect is already underway.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        )
    }

    pub fn record(&self) -> DeviceRecord {
        self.device.to_record(self.state)
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: HashMap<String, RegistryEntry>,
    releasing: HashMap<HandleId, NativeHandle>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(device_id)
    }

    pub fn get_mut(&mut self, device_id: &str) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(device_id)
    }

    /// Insert or replace; the previous entry, if any, is returned.
    pub fn upsert(&mut self, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.entries.insert(entry.device.id.clone(), entry)
    }

    pub fn remove(&mut self, device_id: &str) -> Option<RegistryEntry> {
        self.entries.remove(device_id)
    }

    pub fn find_by_handle_mut(&mut self, handle: HandleId) -> Option<&mut RegistryEntry> {
        self.entries
            .values_mut()
            .find(|entry| entry.handle_id() == Some(handle))
    }

    pub fn state_of(&self, device_id: &str) -> ConnectionState {
        self.entries
            .get(device_id)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep a handle until its disconnect completes.
    pub fn park_for_release(&mut self, handle: NativeHandle) {
        self.releasing.insert(handle.id(), handle);
    }

    pub fn is_releasing(&self, handle: HandleId) -> bool {
        self.releasing.contains_key(&handle)
    }

    pub fn take_released(&mut self, handle: HandleId) -> Option<NativeHandle> {
        self.releasing.remove(&handle)
    }

    pub fn releasing(&self) -> usize {
        self.releasing.len()
    }

    /// Empty the registry, returning every handle still owned together with
    /// whether its link may still be up.
    pub fn drain_handles(&mut self) -> Vec<(NativeHandle, bool)> {
        let mut handles: Vec<(NativeHandle, bool)> = self
            .entries
            .drain()
            .filter_map(|(_, entry)| {
                let up = !entry.state.is_terminal();
                entry.into_handle().map(|handle| (handle, up))
            })
            .collect();
        handles.extend(self.releasing.drain().map(|(_, handle)| (handle, false)));
        handles
    }
}
