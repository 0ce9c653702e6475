//! Serial port transport for the two-wire bus
//!
//! This module provides async serial communication using tokio-serial. The
//! adapter sits on a half-duplex party line, so everything written comes
//! back on the read side and is delivered to the engine like any other frame.
//!
//! Stream framing is handled by [`FrameDecoder`](crate::wire::FrameDecoder):
//! - 2 bytes: Sync word (0xB7 0x5A)
//! - 2 bytes: Sealed frame length (big-endian)
//! - N bytes: Frame body followed by the CRC-32 trailer

use crate::config::DEFAULT_BAUD_RATE;
use crate::error::{BusError, Result};
use crate::transport::{FrameSink, FrameTransport};
use crate::wire::{self, FrameDecoder};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Default serial read timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial transport for the bus
pub struct SerialTransport {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Write side of the stream
    writer: tokio::sync::Mutex<WriteHalf<SerialStream>>,

    /// Current frame sink, shared with the reader task
    sink: Arc<Mutex<Option<FrameSink>>>,

    /// Set to make the reader discard its partial frame
    restart: Arc<AtomicBool>,

    /// Reader task
    reader_task: JoinHandle<()>,

    /// Transport name for logging
    name: String,
}

impl SerialTransport {
    /// Open a serial port with the default baud rate
    pub async fn open(port: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_baud(port, DEFAULT_BAUD_RATE).await
    }

    /// Open a serial port
    pub async fn open_with_baud(port: impl AsRef<Path>, baud_rate: u32) -> Result<Self> {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());
        info!(port = %port_path.display(), baud = baud_rate, "Opening serial port");

        if !port_path.exists() {
            return Err(BusError::PortNotFound(port_path.display().to_string()));
        }

        let stream = tokio_serial::new(port_path.to_string_lossy(), baud_rate)
            .timeout(DEFAULT_TIMEOUT)
            .open_native_async()
            .map_err(|e| BusError::PortOpenFailed {
                port: port_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let (reader, writer) = tokio::io::split(stream);
        let sink = Arc::new(Mutex::new(None));
        let restart = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_loop(
            reader,
            sink.clone(),
            restart.clone(),
            name.clone(),
        ));

        info!(port = %port_path.display(), "Serial bus transport ready");
        Ok(Self {
            port_path,
            baud_rate,
            writer: tokio::sync::Mutex::new(writer),
            sink,
            restart,
            reader_task,
            name,
        })
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

/// Decode frames from the read half and hand them to the sink
async fn read_loop(
    mut reader: ReadHalf<SerialStream>,
    sink: Arc<Mutex<Option<FrameSink>>>,
    restart: Arc<AtomicBool>,
    name: String,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                // EOF - adapter unplugged
                warn!(transport = %name, "Serial port closed");
                break;
            }
            Ok(n) => {
                trace!(bytes = n, "Read from serial port");
                if restart.swap(false, Ordering::SeqCst) {
                    debug!(discarded = decoder.buffered(), "Resetting frame decoder");
                    decoder.reset();
                }
                decoder.extend(&buf[..n]);

                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => deliver(&sink, frame),
                        Ok(None) => break,
                        Err(e) => debug!(error = %e, "Skipping malformed stream data"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Timeout is normal on an idle bus
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                error!(transport = %name, error = %e, "Serial read error");
                break;
            }
        }
    }
}

fn deliver(sink: &Mutex<Option<FrameSink>>, frame: Bytes) {
    let guard = sink.lock();
    let Some(tx) = guard.as_ref() else {
        trace!("No receiver attached, dropping frame");
        return;
    };
    if let Err(e) = tx.try_send(frame) {
        warn!(error = %e, "Reception channel unavailable, dropping frame");
    }
}

#[async_trait]
impl FrameTransport for SerialTransport {
    async fn transmit(&self, frame: Bytes) -> Result<()> {
        if self.reader_task.is_finished() {
            return Err(BusError::Disconnected);
        }

        let packet = wire::encode_stream(&frame)?;
        debug!(size = packet.len(), frame_size = frame.len(), "Writing frame");

        let mut writer = self.writer.lock().await;
        writer.write_all(&packet).await.map_err(|e| {
            error!(error = %e, "Serial write error");
            BusError::WriteError(e.to_string())
        })?;

        writer
            .flush()
            .await
            .map_err(|e| BusError::WriteError(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    fn attach_receiver(&self, sink: FrameSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn restart_reception(&self) -> Result<()> {
        if self.reader_task.is_finished() {
            return Err(BusError::Disconnected);
        }
        self.restart.store(true, Ordering::SeqCst);
        info!(port = %self.port_path.display(), "Reception pipeline restart requested");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("reader_running", &!self.reader_task.is_finished())
            .finish()
    }
}
