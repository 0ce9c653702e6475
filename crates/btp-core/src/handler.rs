//! Upcalls into the application
//!
//! The protocol hands validated payloads upward through [`FrameHandler`] and
//! announces finished discovery cycles through a [`DiscoveryCallback`].

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::frame::SlaveAddress;

/// Receiver of application payloads
///
/// Called from the reception task, so implementations must return quickly.
pub trait FrameHandler: Send + Sync {
    /// Handle a payload; `sender` is set on the master, `None` on a slave
    fn handle_frame(&self, sender: Option<SlaveAddress>, data: Bytes);
}

/// Callback invoked once per completed discovery cycle
pub type DiscoveryCallback = Arc<dyn Fn() + Send + Sync>;

impl<F> FrameHandler for F
where
    F: Fn(Option<SlaveAddress>, Bytes) + Send + Sync,
{
    fn handle_frame(&self, sender: Option<SlaveAddress>, data: Bytes) {
        self(sender, data)
    }
}

/// Payload received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Sending slave (master side only)
    pub sender: Option<SlaveAddress>,
    /// Application payload
    pub data: Bytes,
}

/// Handler forwarding payloads into a channel
///
/// Frames are dropped with a warning when the channel is full.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<ReceivedFrame>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ReceivedFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl FrameHandler for ChannelHandler {
    fn handle_frame(&self, sender: Option<SlaveAddress>, data: Bytes) {
        if let Err(e) = self.tx.try_send(ReceivedFrame { sender, data }) {
            warn!(error = %e, "Dropping received payload");
        }
    }
}
