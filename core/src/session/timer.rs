//! Timers that post back into the session loop.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Deadlines the session arms for itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Scan window `generation` ran out
    ScanElapsed { generation: u64 },
    /// Connection attempt `attempt` to `device_id` ran out
    ConnectTimeout { device_id: String, attempt: u64 },
}

/// A one-shot timer cancelled when dropped.
#[derive(Debug)]
pub struct ScopedTimer {
    task: Option<JoinHandle<()>>,
}

impl ScopedTimer {
    /// Post `event` on `tx` after `delay`.
    pub fn arm(delay: Duration, tx: &mpsc::UnboundedSender<TimerEvent>, event: TimerEvent) -> Self {
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // session gone: nothing left to notify
            let _ = tx.send(event);
        });
        Self { task: Some(task) }
    }

    #[cfg(test)]
    pub fn idle() -> Self {
        Self { task: None }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
