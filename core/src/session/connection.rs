//! Connection Manager
//!
//! connect/disconnect commands, connection timeouts and link state callbacks.
//! Each device owns at most one native connection object; a stale link is
//! revived through the object it already has instead of opening another one.

use super::registry::{ConnectionAttempt, RegistryEntry};
use super::scan::StopReason;
use super::timer::{ScopedTimer, TimerEvent};
use super::SessionCore;
use crate::command::{ReplySlot, Response};
use crate::device::{ConnectionState, DeviceRecord};
use crate::error::BleError;
use crate::platform::{HandleId, NativeDevice, NativeHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

impl SessionCore {
    /// Validate and resolve a caller supplied address.
    async fn resolve_address(&self, address: Option<&str>) -> Result<NativeDevice, BleError> {
        let address = address
            .filter(|address| !address.is_empty())
            .ok_or(BleError::AddressNull)?;
        self.radio
            .resolve_device(address)
            .await
            .ok_or(BleError::AddressNotFound)
    }

    fn arm_attempt(&mut self, device_id: &str, timeout: Duration) -> ConnectionAttempt {
        self.next_attempt += 1;
        let number = self.next_attempt;
        let timer = ScopedTimer::arm(
            timeout,
            &self.timers,
            TimerEvent::ConnectTimeout {
                device_id: device_id.to_string(),
                attempt: number,
            },
        );
        ConnectionAttempt::new(number, timeout, timer)
    }

    pub(super) async fn connect(
        &mut self,
        address: Option<String>,
        timeout: Duration,
        reply: ReplySlot,
    ) {
        let device = match self.resolve_address(address.as_deref()).await {
            Ok(device) => device,
            Err(e) => {
                reply.fail(e);
                return;
            }
        };
        self.stop_scan(StopReason::Preempted).await;

        let existing = self
            .registry
            .get(&device.id)
            .map(|entry| (entry.is_live(), entry.handle().is_some()));
        match existing {
            Some((true, _)) => {
                info!("{} is already connected", device.id);
                reply.fail(BleError::AlreadyConnected);
            }
            Some((false, true)) => self.reconnect(device, timeout, reply).await,
            Some((false, false)) | None => self.open_connection(device, timeout, reply).await,
        }
    }

    async fn reconnect(&mut self, device: NativeDevice, timeout: Duration, reply: ReplySlot) {
        let attempt = self.arm_attempt(&device.id, timeout);
        let Some(entry) = self.registry.get_mut(&device.id) else {
            reply.fail(BleError::ReconnectError);
            return;
        };
        let Some(handle) = entry.handle() else {
            reply.fail(BleError::ReconnectError);
            return;
        };

        info!("Reconnecting {} through {}", device.id, handle.id());
        match self.radio.reconnect(handle).await {
            Ok(()) => {
                entry.device = device;
                entry.attempt = Some(attempt);
                reply.succeed(Response::Ack);
            }
            Err(e) => {
                warn!("Reconnect of {} refused: {}", device.id, e);
                reply.fail(BleError::ReconnectError);
            }
        }
    }

    async fn open_connection(&mut self, device: NativeDevice, timeout: Duration, reply: ReplySlot) {
        let attempt = self.arm_attempt(&device.id, timeout);
        let device_id = device.id.clone();
        // Registered before the native call so the timeout covers it
        self.registry
            .upsert(RegistryEntry::pending(device.clone(), attempt));

        info!("Connecting to {} (timeout {:?})", device_id, timeout);
        match self.radio.connect(&device, self.config.auto_reconnect).await {
            Ok(handle) => {
                match self.registry.get_mut(&device_id) {
                    Some(entry) => entry.establish(handle),
                    None => self.radio.close(handle).await,
                }
                reply.succeed(Response::Ack);
            }
            Err(e) => {
                self.registry.remove(&device_id);
                warn!("Connect to {} failed: {}", device_id, e);
                reply.fail(e.into());
            }
        }
    }

    pub(super) async fn disconnect(&mut self, address: Option<String>, reply: ReplySlot) {
        let device = match self.resolve_address(address.as_deref()).await {
            Ok(device) => device,
            Err(e) => {
                reply.fail(e);
                return;
            }
        };
        self.stop_scan(StopReason::Preempted).await;

        match self.registry.remove(&device.id) {
            Some(entry) => {
                info!("Disconnecting {}", device.id);
                if let Some(handle) = entry.into_handle() {
                    self.release(handle).await;
                }
            }
            None => debug!("{} has no connection to drop", device.id),
        }
        reply.succeed(Response::Ack);
    }

    /// Disconnect a handle the registry no longer holds. Closed right away
    /// when the link is already down or the stack refused the disconnect,
    /// otherwise once the stack reports `Disconnected`.
    async fn release(&mut self, handle: NativeHandle) {
        let state = self.radio.connection_state(&handle).await;
        let issued = match self.radio.disconnect(&handle).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Native disconnect of {} failed: {}", handle.device_id(), e);
                false
            }
        };
        if state.is_terminal() || !issued {
            self.radio.close(handle).await;
        } else {
            debug!("{} waits for Disconnected before close", handle.id());
            self.registry.park_for_release(handle);
        }
    }

    pub(super) async fn on_connect_timeout(&mut self, device_id: String, attempt: u64) {
        let current = self
            .registry
            .get(&device_id)
            .and_then(|entry| entry.attempt.as_ref())
            .map(|attempt| attempt.number);
        if current != Some(attempt) {
            debug!("Stale connect timer for {} (attempt {})", device_id, attempt);
            return;
        }

        let native_state = match self.registry.get(&device_id).and_then(RegistryEntry::handle) {
            Some(handle) => self.radio.connection_state(handle).await,
            None => ConnectionState::Disconnected,
        };
        let reported_state = self.registry.state_of(&device_id);
        if native_state == ConnectionState::Connected || reported_state == ConnectionState::Connected {
            if let Some(entry) = self.registry.get_mut(&device_id) {
                entry.attempt = None;
            }
            return;
        }

        let Some(entry) = self.registry.remove(&device_id) else {
            return;
        };
        let waited = entry.attempt.as_ref().map(|a| a.started_at.elapsed());
        warn!(
            "Connection to {} timed out after {:?} ({})",
            device_id, waited, native_state
        );
        // a failed attempt was already reported as Disconnected
        let announce = !entry.state.is_terminal();
        let record = entry.device.to_record(ConnectionState::Disconnected);
        if let Some(handle) = entry.into_handle() {
            if !native_state.is_terminal() {
                if let Err(e) = self.radio.disconnect(&handle).await {
                    warn!("Native disconnect of {} failed: {}", device_id, e);
                }
            }
            self.radio.close(handle).await;
        }
        if announce {
            self.emitter.device_state(record);
        }
    }

    pub(super) async fn on_connection_state(
        &mut self,
        handle: HandleId,
        device: NativeDevice,
        state: ConnectionState,
    ) {
        let record = if let Some(entry) = self.registry.find_by_handle_mut(handle) {
            entry.state = state;
            if state == ConnectionState::Connected {
                entry.attempt = None;
            }
            let name = device.name.clone().or_else(|| entry.device.name.clone());
            DeviceRecord::new(device.id.clone(), name, device.device_type).with_state(state)
        } else if self.registry.is_releasing(handle) {
            if state.is_terminal() {
                if let Some(released) = self.registry.take_released(handle) {
                    self.radio.close(released).await;
                }
            }
            device.to_record(state)
        } else {
            debug!("Dropping {} for closed {}", state, handle);
            return;
        };

        info!("{} is {}", record.id, state);
        self.emitter.device_state(record);
    }
}
