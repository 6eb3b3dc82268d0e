//! Scan Session
//!
//! At most one scan window is open at a time. Each window gets a generation
//! number; the window's timer carries it, so a timer armed for a window that
//! was already closed (restart, preemption) is recognised and ignored.

use super::timer::{ScopedTimer, TimerEvent};
use super::SessionCore;
use crate::command::{ReplySlot, Response};
use crate::error::BleError;
use crate::platform::NativeDevice;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a scan window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The window's own timer ran out
    Elapsed,
    /// A new scan replaced it
    Restarted,
    /// A connect or disconnect took the radio
    Preempted,
    /// Session teardown
    Shutdown,
}

impl StopReason {
    /// `onStopScan` flag for this reason, if one is reported.
    pub fn announced(self, announce_explicit: bool) -> Option<bool> {
        match self {
            StopReason::Elapsed => Some(false),
            StopReason::Restarted | StopReason::Preempted if announce_explicit => Some(true),
            StopReason::Restarted | StopReason::Preempted | StopReason::Shutdown => None,
        }
    }
}

struct ScanWindow {
    generation: u64,
    period: Duration,
    started_at: Instant,
    _timer: ScopedTimer,
}

#[derive(Default)]
pub struct ScanSession {
    window: Option<ScanWindow>,
    generation: u64,
}

impl ScanSession {
    pub fn is_active(&self) -> bool {
        self.window.is_some()
    }

    /// Generation of the most recent window.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.window
            .as_ref()
            .map(|window| window.generation == generation)
            .unwrap_or(false)
    }

    /// Open a window and arm its timer.
    pub fn begin(&mut self, period: Duration, timers: &mpsc::UnboundedSender<TimerEvent>) -> u64 {
        self.generation += 1;
        let generation = self.generation;
        self.window = Some(ScanWindow {
            generation,
            period,
            started_at: Instant::now(),
            _timer: ScopedTimer::arm(period, timers, TimerEvent::ScanElapsed { generation }),
        });
        generation
    }

    /// Close the window, cancelling its timer. Returns how long it was open.
    pub fn end(&mut self) -> Option<Duration> {
        self.window.take().map(|window| {
            debug!(
                "Scan window {} closed after {:?} of {:?}",
                window.generation,
                window.started_at.elapsed(),
                window.period
            );
            window.started_at.elapsed()
        })
    }
}

impl SessionCore {
    pub(super) async fn start_scan(&mut self, period: Duration, reply: ReplySlot) {
        if self.scan_api.is_none() {
            // the scanner object can show up after the radio powers on
            self.scan_api = self.radio.capabilities().scan_api();
        }
        let Some(api) = self.scan_api else {
            warn!("No LE scanner available");
            reply.fail(BleError::ScannerUnavailable);
            return;
        };

        if self.scan.is_active() {
            self.stop_scan(StopReason::Restarted).await;
        }

        if let Err(e) = self.radio.start_scan(api).await {
            warn!("Native scan start failed: {}", e);
            reply.fail(e.into());
            return;
        }
        let generation = self.scan.begin(period, &self.timers);
        info!("Scanning with {:?} for {:?} (window {})", api, period, generation);
        reply.succeed(Response::Ack);
    }

    /// Close the active window, if any. Inactive scans are left alone.
    pub(super) async fn stop_scan(&mut self, reason: StopReason) {
        if self.scan.end().is_none() {
            return;
        }
        if let Err(e) = self.radio.stop_scan().await {
            warn!("Native scan stop failed: {}", e);
        }
        info!("Scan stopped ({:?})", reason);
        if let Some(explicit) = reason.announced(self.config.announce_explicit_stop) {
            self.emitter.stop_scan(explicit);
        }
    }

    pub(super) async fn on_scan_elapsed(&mut self, generation: u64) {
        if !self.scan.is_current(generation) {
            debug!("Ignoring timer of closed scan window {}", generation);
            return;
        }
        self.stop_scan(StopReason::Elapsed).await;
    }

    pub(super) fn on_scan_failed(&mut self, code: i32) {
        // the stack already stopped scanning
        if self.scan.end().is_some() {
            error!("Scan failed with native code {}", code);
            self.emitter.stop_scan(false);
        } else {
            debug!("Scan failure {} outside a scan window", code);
        }
    }

    pub(super) fn on_discovery(&mut self, device: NativeDevice) {
        if !self.scan.is_active() {
            debug!("Dropping late scan result for {}", device.id);
            return;
        }
        let record = device.to_record(self.registry.state_of(&device.id));
        if record.reportable_name().is_none() {
            return;
        }
        debug!("Discovered {} ({:?})", record.id, record.name);
        self.emitter.scan_result(record);
    }

    pub(super) async fn list_paired(&mut self, reply: ReplySlot) {
        match self.radio.bonded_devices().await {
            Ok(devices) => {
                let records: Vec<_> = devices
                    .iter()
                    .map(|device| device.to_record(self.registry.state_of(&device.id)))
                    .filter(|record| record.reportable_name().is_some())
                    .collect();
                debug!("{} of {} bonded devices reportable", records.len(), devices.len());
                reply.succeed(Response::Devices(records));
            }
            Err(e) => {
                warn!("Bonded device query failed: {}", e);
                reply.fail(e.into());
            }
        }
    }
}
