//! Protocol state shared by both roles

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::error::{BusError, Result};

/// Per-device protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusState {
    /// Freshly started or reset; discovery pending
    Initial,
    /// Discovery in progress
    Discover,
    /// Discovery did not converge (master only)
    DiscoverFailed,
    /// Topology known, normal polling
    Ready,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusState::Initial => write!(f, "initial"),
            BusState::Discover => write!(f, "discover"),
            BusState::DiscoverFailed => write!(f, "discover_failed"),
            BusState::Ready => write!(f, "ready"),
        }
    }
}

/// Observable state cell
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<BusState>,
    role: &'static str,
}

impl StateCell {
    pub(crate) fn new(role: &'static str) -> Self {
        let (tx, _) = watch::channel(BusState::Initial);
        Self { tx, role }
    }

    pub(crate) fn get(&self) -> BusState {
        *self.tx.borrow()
    }

    /// Move to `next`, returning the previous state
    pub(crate) fn set(&self, next: BusState) -> BusState {
        let previous = self.tx.send_replace(next);
        if previous != next {
            info!(role = self.role, from = %previous, to = %next, "State transition");
        }
        previous
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<BusState> {
        self.tx.subscribe()
    }

    /// Wait until READY, at most `timeout`
    pub(crate) async fn await_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        // Drop the borrowed state before `rx` goes out of scope
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|s| *s == BusState::Ready))
            .await
            .map(|ready| ready.map(|_| ()));

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BusError::NotRunning),
            Err(_) => Err(BusError::ReadyTimeout {
                duration_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(BusState::DiscoverFailed.to_string(), "discover_failed");
        assert_eq!(BusState::Ready.to_string(), "ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_times_out() {
        let cell = StateCell::new("test");
        let err = cell.await_ready(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, BusError::ReadyTimeout { duration_ms: 50 }));
    }

    #[tokio::test]
    async fn test_await_ready_when_ready() {
        let cell = StateCell::new("test");
        assert_eq!(cell.set(BusState::Ready), BusState::Initial);
        cell.await_ready(Duration::from_millis(50)).await.unwrap();
    }
}
