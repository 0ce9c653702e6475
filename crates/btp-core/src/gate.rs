//! Transmission gate
//!
//! Locks a role's transmit path until the protocol grants it a turn. The
//! master locks after addressing a slave and is released by the slave's
//! acknowledgement; the slave is released by being addressed and locks
//! itself at the end of its turn.

use std::time::Duration;
use tokio::sync::watch;

/// Lock/release signal for a role's transmit turn
#[derive(Debug)]
pub struct TransmitGate {
    open: watch::Sender<bool>,
}

impl TransmitGate {
    /// Create a locked gate
    pub fn locked() -> Self {
        let (open, _) = watch::channel(false);
        Self { open }
    }

    /// Suspend transmission
    pub fn lock(&self) {
        self.open.send_replace(false);
    }

    /// Grant a transmission turn
    pub fn release(&self) {
        self.open.send_replace(true);
    }

    /// Whether transmission is currently permitted
    pub fn is_released(&self) -> bool {
        *self.open.borrow()
    }

    /// Wait until released
    pub async fn wait_released(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Wait until released or `timeout` elapses; returns whether released
    pub async fn wait_released_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_released())
            .await
            .is_ok()
    }
}

impl Default for TransmitGate {
    fn default() -> Self {
        Self::locked()
    }
}
