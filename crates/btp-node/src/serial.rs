//! Serial bus runner
//!
//! Runs one role on a real bus. The data port carries sealed frames, the
//! control port's RTS/CTS pins carry the status line. Lines read from stdin
//! are queued as application payloads; received payloads are logged.

use anyhow::Context;
use btp_core::status::modem::DEFAULT_SAMPLE_INTERVAL;
use btp_core::{
    BusConfig, BusContext, BusMaster, BusSlave, ChannelHandler, ModemStatusLine, ReceivedFrame,
    SerialTransport, SlaveAddress,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Capacity of the inbound payload channel
const INBOX_CAPACITY: usize = 64;

/// Role on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    /// Bus master
    Master,
    /// Bus slave
    Slave,
}

/// Serial runner parameters
#[derive(Debug, Clone)]
pub struct SerialOptions {
    /// Data port
    pub port: String,
    /// Control port for the status line
    pub status_port: String,
    /// Baud rate of the data port
    pub baud: u32,
    /// Role to run
    pub role: Role,
    /// Own address
    pub id: SlaveAddress,
    /// Bus configuration
    pub config: BusConfig,
}

/// Run until stdin closes or Ctrl+C
pub async fn run(options: SerialOptions) -> anyhow::Result<()> {
    let transport = SerialTransport::open_with_baud(&options.port, options.baud)
        .await
        .with_context(|| format!("opening data port {}", options.port))?;
    let status_line = ModemStatusLine::open(&options.status_port, DEFAULT_SAMPLE_INTERVAL)
        .with_context(|| format!("opening control port {}", options.status_port))?;
    let ctx = BusContext::new(Arc::new(transport), Arc::new(status_line));

    let (inbox, inbox_rx) = ChannelHandler::new(INBOX_CAPACITY);
    let inbox = Arc::new(inbox);

    match options.role {
        Role::Master => {
            let master = BusMaster::start(options.id, ctx, options.config, inbox)?;
            master.on_discovery_finished(|| info!("Discovery finished"));
            serve(inbox_rx, |line| {
                let (destination, payload) = split_destination(line)?;
                master.transmit_frame(payload.to_owned(), destination)?;
                Ok(())
            })
            .await?;
            info!(stats = ?master.stats(), "Master stopped");
        }
        Role::Slave => {
            let slave = BusSlave::start(options.id, ctx, options.config, inbox)?;
            slave.on_discovery_finished(|| info!("Registered with master"));
            serve(inbox_rx, |line| {
                slave.transmit_frame(line.to_owned())?;
                Ok(())
            })
            .await?;
            info!(stats = ?slave.stats(), "Slave stopped");
        }
    }

    Ok(())
}

/// Forward stdin lines to `send` and log inbound payloads
async fn serve<F>(mut inbox: mpsc::Receiver<ReceivedFrame>, mut send: F) -> anyhow::Result<()>
where
    F: FnMut(&str) -> anyhow::Result<()>,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        if let Err(e) = send(line.trim()) {
                            warn!(error = %e, "Payload not queued");
                        }
                    }
                    None => return Ok(()),
                }
            }
            Some(frame) = inbox.recv() => {
                let text = String::from_utf8_lossy(&frame.data);
                match frame.sender {
                    Some(sender) => info!(%sender, payload = %text, "Received"),
                    None => info!(payload = %text, "Received"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
        }
    }
}

/// Split `0xADDR payload` into destination and payload
///
/// A line without a leading address goes to the default destination.
fn split_destination(line: &str) -> anyhow::Result<(Option<SlaveAddress>, &str)> {
    if let Some((head, rest)) = line.split_once(' ') {
        if head.starts_with("0x") || head.starts_with("0X") {
            let address: SlaveAddress = head.parse()?;
            return Ok((Some(address), rest));
        }
    }
    Ok((None, line))
}
