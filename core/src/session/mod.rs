//! Central Session
//!
//! One task owns all session state: the adapter gate, the device registry,
//! the scan window. Commands, native callbacks and timer deadlines are all
//! funnelled into that task and handled one at a time, so no lock guards the
//! registry and callbacks never race a command halfway through.
//!
//! ```text
//! SessionHandle ──commands──┐
//! NativeRadio ───callbacks──┼──> SessionCore ──events──> EventStream
//! ScopedTimer ──deadlines───┘
//! ```

pub mod gate;
pub mod registry;
pub mod scan;
pub mod timer;

mod connection;

pub use gate::{AdapterGate, Operation, PromptKind, Readiness};
pub use scan::StopReason;
pub use timer::TimerEvent;

use crate::command::{Command, CommandResult, PendingCommand, Response};
use crate::config::{ConfigError, SessionConfig};
use crate::device::DeviceRecord;
use crate::error::{BleError, RadioError};
use crate::events::{EventEmitter, EventStream};
use crate::platform::{
    NativeRadio, PermissionProvider, PlatformEvent, PlatformEventSink, RequestTag, ScanApi,
};
use registry::DeviceRegistry;
use scan::ScanSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

enum SessionMessage {
    Command(PendingCommand),
    Shutdown { done: oneshot::Sender<()> },
}

/// Entry point: spawns the session task.
pub struct BleSession;

impl BleSession {
    /// Start a session on the current tokio runtime.
    pub fn spawn(
        radio: Arc<dyn NativeRadio>,
        permissions: Arc<dyn PermissionProvider>,
        config: SessionConfig,
    ) -> Result<(SessionHandle, EventStream), ConfigError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (emitter, events) = EventEmitter::channel();

        let sink = PlatformEventSink::new(platform_tx);
        radio.attach(sink.clone());
        permissions.attach(sink.clone());

        let scan_api = radio.capabilities().scan_api();
        info!(
            "BLE session starting on {} (scan api: {:?})",
            radio.platform_name(),
            scan_api
        );

        let core = SessionCore {
            radio,
            permissions,
            config,
            emitter,
            timers: timer_tx,
            gate: AdapterGate::new(),
            registry: DeviceRegistry::new(),
            scan: ScanSession::default(),
            scan_api,
            next_attempt: 0,
        };
        tokio::spawn(core.run(command_rx, platform_rx, timer_rx));

        Ok((
            SessionHandle {
                command_tx,
                sink,
            },
            events,
        ))
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionMessage>,
    sink: PlatformEventSink,
}

impl SessionHandle {
    /// Queue a command; the receiver completes once the command does, which
    /// for a command parked behind a prompt is after the prompt resolves.
    pub async fn submit(
        &self,
        command: Command,
    ) -> Result<oneshot::Receiver<CommandResult>, BleError> {
        let (pending, rx) = PendingCommand::new(command);
        self.command_tx
            .send(SessionMessage::Command(pending))
            .await
            .map_err(|_| BleError::SessionClosed)?;
        Ok(rx)
    }

    /// Run a command to completion.
    pub async fn execute(&self, command: Command) -> CommandResult {
        let rx = self.submit(command).await?;
        rx.await.unwrap_or(Err(BleError::SessionClosed))
    }

    pub async fn platform_name(&self) -> Result<String, BleError> {
        match self.execute(Command::GetPlatformName).await? {
            Response::PlatformName(name) => Ok(name),
            other => Err(unexpected("getPlatformName", other)),
        }
    }

    pub async fn is_available(&self) -> Result<bool, BleError> {
        self.flag(Command::IsAvailable).await
    }

    pub async fn is_enabled(&self) -> Result<bool, BleError> {
        self.flag(Command::IsEnabled).await
    }

    /// Open a scan window; `None` uses the configured default period.
    pub async fn scan(&self, period_ms: Option<i64>) -> Result<(), BleError> {
        self.ack(Command::Scan { period_ms }).await
    }

    pub async fn paired(&self) -> Result<Vec<DeviceRecord>, BleError> {
        match self.execute(Command::Paired).await? {
            Response::Devices(devices) => Ok(devices),
            other => Err(unexpected("paired", other)),
        }
    }

    pub async fn connect(&self, address: &str, timeout_ms: Option<i64>) -> Result<(), BleError> {
        self.ack(Command::Connect {
            address: Some(address.to_string()),
            timeout_ms,
        })
        .await
    }

    pub async fn disconnect(&self, address: &str) -> Result<(), BleError> {
        self.ack(Command::Disconnect {
            address: Some(address.to_string()),
        })
        .await
    }

    /// Deliver a permission prompt outcome from the host.
    pub fn permission_result(&self, tag: RequestTag, granted: bool) {
        self.sink.permission_result(tag, granted);
    }

    /// Deliver a power-on prompt outcome from the host.
    pub fn enable_result(&self, tag: RequestTag, enabled: bool) {
        self.sink.enable_result(tag, enabled);
    }

    /// Sink for hosts that forward native callbacks themselves.
    pub fn event_sink(&self) -> PlatformEventSink {
        self.sink.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    /// Stop scanning, release every connection and fail anything still
    /// pending. Returns once the session task has finished.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self
            .command_tx
            .send(SessionMessage::Shutdown { done })
            .await
            .is_err()
        {
            debug!("Session already closed");
            return;
        }
        let _ = rx.await;
    }

    async fn flag(&self, command: Command) -> Result<bool, BleError> {
        let method = command.method();
        match self.execute(command).await? {
            Response::Flag(flag) => Ok(flag),
            other => Err(unexpected(method, other)),
        }
    }

    async fn ack(&self, command: Command) -> Result<(), BleError> {
        let method = command.method();
        match self.execute(command).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(method, other)),
        }
    }
}

fn unexpected(method: &str, response: Response) -> BleError {
    BleError::Radio(RadioError::Failed(format!(
        "unexpected {} response: {:?}",
        method, response
    )))
}

/// Millisecond argument; negative values are rejected.
fn duration_arg(name: &str, value: Option<i64>, default: Duration) -> Result<Duration, BleError> {
    match value {
        None => Ok(default),
        Some(ms) => u64::try_from(ms).map(Duration::from_millis).map_err(|_| {
            BleError::InvalidArgument(format!("{} must not be negative (got {})", name, ms))
        }),
    }
}

/// Connect timeout argument; zero is refused like a zero configured default.
fn timeout_arg(value: Option<i64>, default: Duration) -> Result<Duration, BleError> {
    let timeout = duration_arg("timeout", value, default)?;
    if timeout.is_zero() {
        return Err(BleError::InvalidArgument("timeout must be > 0".to_string()));
    }
    Ok(timeout)
}

// ============================================================================
// SESSION TASK
// ============================================================================

struct SessionCore {
    radio: Arc<dyn NativeRadio>,
    permissions: Arc<dyn PermissionProvider>,
    config: SessionConfig,
    emitter: EventEmitter,
    timers: mpsc::UnboundedSender<TimerEvent>,
    gate: AdapterGate,
    registry: DeviceRegistry,
    scan: ScanSession,
    scan_api: Option<ScanApi>,
    next_attempt: u64,
}

impl SessionCore {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionMessage>,
        mut platform: mpsc::UnboundedReceiver<PlatformEvent>,
        mut timers: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        loop {
            // Callbacks first: a command must see every state change the
            // stack reported before it arrived.
            tokio::select! {
                biased;

                Some(event) = platform.recv() => self.on_platform_event(event).await,

                Some(deadline) = timers.recv() => self.on_timer(deadline).await,

                message = commands.recv() => match message {
                    Some(SessionMessage::Command(pending)) => self.handle_command(pending).await,
                    Some(SessionMessage::Shutdown { done }) => {
                        self.teardown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
            }
        }
        info!("BLE session stopped");
    }

    async fn handle_command(&mut self, pending: PendingCommand) {
        debug!("Handling {}", pending.command.method());

        let window = match &pending.command {
            Command::Scan { period_ms } => {
                duration_arg("period", *period_ms, self.config.default_scan_period())
            }
            Command::Connect { timeout_ms, .. } => {
                timeout_arg(*timeout_ms, self.config.default_connect_timeout())
            }
            _ => Ok(Duration::ZERO),
        };
        let window = match window {
            Ok(window) => window,
            Err(e) => {
                pending.reply.fail(e);
                return;
            }
        };

        let pending = match pending.command.operation() {
            Some(operation) => {
                match self
                    .gate
                    .admit(operation, pending, &*self.radio, &*self.permissions)
                    .await
                {
                    Some(pending) => pending,
                    None => return,
                }
            }
            None => pending,
        };

        let PendingCommand { command, reply } = pending;
        match command {
            Command::GetPlatformName => {
                reply.succeed(Response::PlatformName(self.radio.platform_name()))
            }
            Command::IsAvailable => reply.succeed(Response::Flag(self.radio.is_available().await)),
            Command::IsEnabled => {
                let enabled = self.radio.is_available().await && self.radio.is_enabled().await;
                reply.succeed(Response::Flag(enabled))
            }
            Command::Scan { .. } => self.start_scan(window, reply).await,
            Command::Paired => self.list_paired(reply).await,
            Command::Connect { address, .. } => self.connect(address, window, reply).await,
            Command::Disconnect { address } => self.disconnect(address, reply).await,
        }
    }

    async fn on_platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::ScanResult(device) => self.on_discovery(device),
            PlatformEvent::ScanFailed { code } => self.on_scan_failed(code),
            PlatformEvent::ConnectionStateChanged {
                handle,
                device,
                state,
            } => self.on_connection_state(handle, device, state).await,
            PlatformEvent::PermissionResult { tag, granted } => {
                self.on_prompt_result(tag, granted).await
            }
            PlatformEvent::EnableResult { tag, enabled } => {
                self.on_prompt_result(tag, enabled).await
            }
        }
    }

    async fn on_prompt_result(&mut self, tag: RequestTag, approved: bool) {
        // Approved commands re-enter the gate: a granted permission may still
        // leave the radio powered off.
        for pending in self.gate.resolve(tag, approved) {
            self.handle_command(pending).await;
        }
    }

    async fn on_timer(&mut self, deadline: TimerEvent) {
        match deadline {
            TimerEvent::ScanElapsed { generation } => self.on_scan_elapsed(generation).await,
            TimerEvent::ConnectTimeout { device_id, attempt } => {
                self.on_connect_timeout(device_id, attempt).await
            }
        }
    }

    async fn teardown(&mut self) {
        info!(
            "Tearing down session ({} devices, {} releasing)",
            self.registry.len(),
            self.registry.releasing()
        );
        self.stop_scan(StopReason::Shutdown).await;
        self.gate.close();
        for (handle, connected) in self.registry.drain_handles() {
            if connected {
                if let Err(e) = self.radio.disconnect(&handle).await {
                    warn!("Disconnect of {} during shutdown failed: {}", handle.device_id(), e);
                }
            }
            self.radio.close(handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_arg() {
        let default = Duration::from_millis(2000);
        assert_eq!(duration_arg("period", None, default), Ok(default));
        assert_eq!(
            duration_arg("period", Some(0), default),
            Ok(Duration::ZERO)
        );
        assert_eq!(
            duration_arg("period", Some(150), default),
            Ok(Duration::from_millis(150))
        );
        assert!(matches!(
            duration_arg("period", Some(-1), default),
            Err(BleError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_timeout_arg_refuses_zero() {
        let default = Duration::from_millis(2000);
        assert_eq!(timeout_arg(None, default), Ok(default));
        assert_eq!(timeout_arg(Some(1), default), Ok(Duration::from_millis(1)));
        assert!(matches!(
            timeout_arg(Some(0), default),
            Err(BleError::InvalidArgument(_))
        ));
        assert!(matches!(
            timeout_arg(Some(-3), default),
            Err(BleError::InvalidArgument(_))
        ));
    }
}
