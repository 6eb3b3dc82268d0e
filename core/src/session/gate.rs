//! Adapter State Gate
//!
//! Every BLE operation passes through here before touching the radio. The
//! gate either admits the command, fails it, or parks it under an operation
//! tag while the user answers a permission or power-on prompt. Parked
//! commands are re-run from the top once the prompt resolves.

use crate::command::PendingCommand;
use crate::error::BleError;
use crate::platform::{
    NativeRadio, PermissionProvider, PermissionScope, PermissionStatus, RequestTag,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Operations that need the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Scan,
    Connect,
    Disconnect,
    Paired,
}

/// What a parked command is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Permission,
    PowerOn,
}

impl PromptKind {
    /// Error reported when the prompt is refused or cannot be shown.
    pub fn refusal(self) -> BleError {
        match self {
            PromptKind::Permission => BleError::NoPermissions,
            PromptKind::PowerOn => BleError::BluetoothDisabled,
        }
    }
}

const ALL_OPERATIONS: [Operation; 4] = [
    Operation::Scan,
    Operation::Connect,
    Operation::Paired,
    Operation::Disconnect,
];

impl Operation {
    pub fn required_scopes(self) -> &'static [PermissionScope] {
        match self {
            Operation::Scan => &[PermissionScope::FineLocation, PermissionScope::BluetoothScan],
            Operation::Connect | Operation::Disconnect | Operation::Paired => &[
                PermissionScope::FineLocation,
                PermissionScope::BluetoothScan,
                PermissionScope::BluetoothConnect,
            ],
        }
    }

    fn tag_base(self) -> u32 {
        match self {
            Operation::Scan => 2021,
            Operation::Connect => 2023,
            Operation::Paired => 2025,
            Operation::Disconnect => 2027,
        }
    }

    pub fn tag(self, kind: PromptKind) -> RequestTag {
        match kind {
            PromptKind::Permission => RequestTag(self.tag_base()),
            PromptKind::PowerOn => RequestTag(self.tag_base() + 1),
        }
    }

    pub fn from_tag(tag: RequestTag) -> Option<(Operation, PromptKind)> {
        ALL_OPERATIONS.iter().find_map(|op| {
            if tag == op.tag(PromptKind::Permission) {
                Some((*op, PromptKind::Permission))
            } else if tag == op.tag(PromptKind::PowerOn) {
                Some((*op, PromptKind::PowerOn))
            } else {
                None
            }
        })
    }
}

/// Outcome of a readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NeedsPermission,
    NeedsPowerOn,
    Unavailable,
}

pub async fn check_ready(
    radio: &dyn NativeRadio,
    permissions: &dyn PermissionProvider,
    operation: Operation,
) -> Readiness {
    if !radio.is_available().await {
        return Readiness::Unavailable;
    }
    if permissions.check(operation.required_scopes()).await == PermissionStatus::Denied {
        return Readiness::NeedsPermission;
    }
    if !radio.is_enabled().await {
        return Readiness::NeedsPowerOn;
    }
    Readiness::Ready
}

/// Gate state: commands parked per prompt tag.
#[derive(Debug, Default)]
pub struct AdapterGate {
    suspended: HashMap<RequestTag, Vec<PendingCommand>>,
}

impl AdapterGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `pending` for `operation`, or complete/park it.
    ///
    /// Returns the command back only when it may proceed.
    pub async fn admit(
        &mut self,
        operation: Operation,
        pending: PendingCommand,
        radio: &dyn NativeRadio,
        permissions: &dyn PermissionProvider,
    ) -> Option<PendingCommand> {
        match check_ready(radio, permissions, operation).await {
            Readiness::Ready => Some(pending),
            Readiness::Unavailable => {
                warn!("{:?} rejected: Bluetooth unavailable", operation);
                pending.reply.fail(BleError::Unavailable);
                None
            }
            Readiness::NeedsPermission => {
                let tag = operation.tag(PromptKind::Permission);
                if self.park(tag, pending) {
                    info!("{:?} waiting for permission prompt (tag {})", operation, tag);
                    if let Err(e) = permissions.request(operation.required_scopes(), tag).await {
                        warn!("Permission prompt failed: {}", e);
                        self.refuse(tag, PromptKind::Permission);
                    }
                }
                None
            }
            Readiness::NeedsPowerOn => {
                let tag = operation.tag(PromptKind::PowerOn);
                if self.park(tag, pending) {
                    info!("{:?} waiting for power-on prompt (tag {})", operation, tag);
                    if let Err(e) = radio.request_enable(tag).await {
                        warn!("Enable prompt failed: {}", e);
                        self.refuse(tag, PromptKind::PowerOn);
                    }
                }
                None
            }
        }
    }

    /// Park a command; true when it is the first one on this tag and the
    /// prompt still has to be shown.
    fn park(&mut self, tag: RequestTag, pending: PendingCommand) -> bool {
        let waiting = self.suspended.entry(tag).or_default();
        waiting.push(pending);
        waiting.len() == 1
    }

    fn refuse(&mut self, tag: RequestTag, kind: PromptKind) {
        for pending in self.suspended.remove(&tag).unwrap_or_default() {
            pending.reply.fail(kind.refusal());
        }
    }

    /// A prompt resolved. Refused prompts fail their commands here; approved
    /// ones hand the commands back, in arrival order, to be run again.
    pub fn resolve(&mut self, tag: RequestTag, approved: bool) -> Vec<PendingCommand> {
        let Some((operation, kind)) = Operation::from_tag(tag) else {
            debug!("Ignoring prompt result for unknown tag {}", tag);
            return Vec::new();
        };
        if !self.suspended.contains_key(&tag) {
            debug!("Ignoring prompt result for tag {}: nothing waiting", tag);
            return Vec::new();
        }
        if approved {
            info!("{:?} prompt for {:?} approved", kind, operation);
            self.suspended.remove(&tag).unwrap_or_default()
        } else {
            info!("{:?} prompt for {:?} refused", kind, operation);
            self.refuse(tag, kind);
            Vec::new()
        }
    }

    pub fn waiting(&self, tag: RequestTag) -> usize {
        self.suspended.get(&tag).map(Vec::len).unwrap_or(0)
    }

    pub fn is_idle(&self) -> bool {
        self.suspended.is_empty()
    }

    /// Fail everything still parked; used on teardown.
    pub fn close(&mut self) {
        for (_, waiting) in self.suspended.drain() {
            for pending in waiting {
                pending.reply.fail(BleError::SessionClosed);
            }
        }
    }
}
