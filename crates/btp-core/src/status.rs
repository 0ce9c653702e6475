//! Bus status line
//!
//! A single open-drain line shared by all devices. Any slave pulls it low
//! while it is present but not yet registered; the master samples it at the
//! end of discovery and watches it for falling edges while polling.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Electrical level of the status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
    /// Released: no device requests attention
    High,
    /// Pulled low by at least one device
    Low,
}

impl fmt::Display for LineLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineLevel::High => write!(f, "high"),
            LineLevel::Low => write!(f, "low"),
        }
    }
}

/// One device's connection to the status line
pub trait StatusLine: Send + Sync {
    /// Pull the line low (`true`) or release it (`false`)
    fn set_attention(&self, asserted: bool);

    /// Current level of the shared line
    fn level(&self) -> LineLevel;

    /// Watch level changes
    fn subscribe(&self) -> watch::Receiver<LineLevel>;
}

/// In-process open-drain wire
///
/// Devices connect through [`StatusLineTap`]s; the line is low while any
/// tap asserts.
#[derive(Debug, Clone)]
pub struct SharedStatusLine {
    inner: Arc<LineInner>,
}

#[derive(Debug)]
struct LineInner {
    asserted: Mutex<usize>,
    level_tx: watch::Sender<LineLevel>,
}

impl SharedStatusLine {
    /// Create a released line
    pub fn new() -> Self {
        let (level_tx, _) = watch::channel(LineLevel::High);
        Self {
            inner: Arc::new(LineInner {
                asserted: Mutex::new(0),
                level_tx,
            }),
        }
    }

    /// Connect a device
    pub fn tap(&self) -> StatusLineTap {
        StatusLineTap {
            line: self.clone(),
            asserted: AtomicBool::new(false),
        }
    }

    /// Current level
    pub fn level(&self) -> LineLevel {
        *self.inner.level_tx.borrow()
    }

    /// Number of devices currently pulling the line low
    pub fn asserted_count(&self) -> usize {
        *self.inner.asserted.lock()
    }

    fn adjust(&self, assert: bool) {
        let mut count = self.inner.asserted.lock();
        if assert {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
        }
        let level = if *count == 0 {
            LineLevel::High
        } else {
            LineLevel::Low
        };
        trace!(asserted = *count, %level, "Status line updated");
        self.inner.level_tx.send_if_modified(|current| {
            if *current != level {
                *current = level;
                true
            } else {
                false
            }
        });
    }
}

impl Default for SharedStatusLine {
    fn default() -> Self {
        Self::new()
    }
}

/// A device's handle on a [`SharedStatusLine`]
#[derive(Debug)]
pub struct StatusLineTap {
    line: SharedStatusLine,
    asserted: AtomicBool,
}

impl StatusLineTap {
    /// Whether this device is currently pulling the line low
    pub fn is_asserted(&self) -> bool {
        self.asserted.load(Ordering::SeqCst)
    }
}

impl StatusLine for StatusLineTap {
    fn set_attention(&self, asserted: bool) {
        if self.asserted.swap(asserted, Ordering::SeqCst) != asserted {
            self.line.adjust(asserted);
        }
    }

    fn level(&self) -> LineLevel {
        self.line.level()
    }

    fn subscribe(&self) -> watch::Receiver<LineLevel> {
        self.line.inner.level_tx.subscribe()
    }
}

impl Drop for StatusLineTap {
    fn drop(&mut self) {
        // A detached device no longer drives the line
        if self.asserted.swap(false, Ordering::SeqCst) {
            self.line.adjust(false);
        }
    }
}

#[cfg(feature = "serial")]
pub use modem::ModemStatusLine;

#[cfg(feature = "serial")]
pub mod modem {
    //! Status line on serial modem-control pins
    //!
    //! RTS drives the line (asserted = attention), CTS reads the wired-OR
    //! of all devices. CTS has no edge interrupt on most adapters, so it is
    //! sampled by a background task.

    use super::{LineLevel, StatusLine};
    use crate::error::Result;
    use parking_lot::Mutex;
    use serialport::SerialPort;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tracing::{info, warn};

    /// Default CTS sampling period
    pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(5);

    /// Status line wired to RTS/CTS of a serial control port
    pub struct ModemStatusLine {
        port: Arc<Mutex<Box<dyn SerialPort>>>,
        level_tx: Arc<watch::Sender<LineLevel>>,
        sampler: tokio::task::JoinHandle<()>,
    }

    impl ModemStatusLine {
        /// Open the control port and start sampling CTS
        pub fn open(path: &str, sample_interval: Duration) -> Result<Self> {
            let port = serialport::new(path, crate::config::DEFAULT_BAUD_RATE)
                .timeout(Duration::from_millis(10))
                .open()?;
            info!(port = path, "Opened status line control port");

            let port = Arc::new(Mutex::new(port));
            let initial = sample(&port).unwrap_or(LineLevel::High);
            let (level_tx, _) = watch::channel(initial);
            let level_tx = Arc::new(level_tx);

            let sampler = {
                let port = port.clone();
                let level_tx = level_tx.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(sample_interval);
                    loop {
                        ticker.tick().await;
                        match sample(&port) {
                            Some(level) => {
                                level_tx.send_if_modified(|current| {
                                    let changed = *current != level;
                                    *current = level;
                                    changed
                                });
                            }
                            None => warn!("Failed to sample CTS"),
                        }
                    }
                })
            };

            Ok(Self {
                port,
                level_tx,
                sampler,
            })
        }
    }

    /// CTS asserted means some device holds the line low
    fn sample(port: &Mutex<Box<dyn SerialPort>>) -> Option<LineLevel> {
        port.lock().read_clear_to_send().ok().map(|cts| {
            if cts {
                LineLevel::Low
            } else {
                LineLevel::High
            }
        })
    }

    impl StatusLine for ModemStatusLine {
        fn set_attention(&self, asserted: bool) {
            if let Err(e) = self.port.lock().write_request_to_send(asserted) {
                warn!(error = %e, "Failed to drive RTS");
            }
        }

        fn level(&self) -> LineLevel {
            *self.level_tx.borrow()
        }

        fn subscribe(&self) -> watch::Receiver<LineLevel> {
            self.level_tx.subscribe()
        }
    }

    impl Drop for ModemStatusLine {
        fn drop(&mut self) {
            self.sampler.abort();
        }
    }
}
