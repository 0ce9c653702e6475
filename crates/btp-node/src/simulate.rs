//! In-memory bus simulation
//!
//! Starts a master and N slaves on one [`MemoryBus`]. Each slave sends a
//! telemetry frame at a jittered interval and the master echoes every
//! payload back to the slave it came from.

use anyhow::Context;
use btp_core::{
    BusConfig, BusContext, BusError, BusMaster, BusSlave, BusStats, ChannelHandler, MemoryBus,
    SharedStatusLine, SlaveAddress, SlaveHandle,
};
use futures::future::try_join_all;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Address block used for simulated slaves
const SIMULATED_ADDRESS_BASE: u64 = 0x5100_0000_0000_0000;

/// Capacity of the master's inbound channel
const MASTER_INBOX_CAPACITY: usize = 256;

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Number of slaves
    pub slaves: usize,
    /// How long to exchange traffic after discovery
    pub duration: Duration,
    /// Mean interval between telemetry frames per slave
    pub telemetry_interval: Duration,
    /// Bound on the initial discovery
    pub ready_timeout: Duration,
    /// Bus configuration shared by every role
    pub config: BusConfig,
}

/// Outcome of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Slaves in the master's registry at the end
    pub registered: usize,
    /// Telemetry frames queued by slaves
    pub telemetry_sent: u64,
    /// Telemetry frames the slaves could not queue
    pub telemetry_dropped: u64,
    /// Echoes that made it back to a slave
    pub echoes_received: u64,
    /// Master counters
    pub master: BusStats,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slaves={} telemetry_sent={} telemetry_dropped={} echoes_received={} \
             frames_sent={} frames_received={} ack_timeouts={} discovery_cycles={} rediscoveries={}",
            self.registered,
            self.telemetry_sent,
            self.telemetry_dropped,
            self.echoes_received,
            self.master.frames_sent,
            self.master.frames_received,
            self.master.ack_timeouts,
            self.master.discovery_cycles,
            self.master.rediscoveries,
        )
    }
}

#[derive(Debug, Default)]
struct TrafficCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
    echoed: AtomicU64,
}

fn simulated_address(index: usize) -> SlaveAddress {
    SlaveAddress::new(SIMULATED_ADDRESS_BASE | (index as u64 + 1))
}

/// Run the simulation to completion
pub async fn run(options: SimulationOptions) -> anyhow::Result<SimulationReport> {
    let bus = MemoryBus::new();
    let line = SharedStatusLine::new();
    let counters = Arc::new(TrafficCounters::default());

    let (inbox, mut inbox_rx) = ChannelHandler::new(MASTER_INBOX_CAPACITY);
    let master = Arc::new(BusMaster::start(
        SlaveAddress::new(0),
        BusContext::new(bus.attach("master"), Arc::new(line.tap())),
        options.config.clone(),
        Arc::new(inbox),
    )?);

    let mut slaves = Vec::with_capacity(options.slaves);
    for index in 0..options.slaves {
        let address = simulated_address(index);
        let echoes = counters.clone();
        let slave = BusSlave::start(
            address,
            BusContext::new(bus.attach(format!("slave-{index}")), Arc::new(line.tap())),
            options.config.clone(),
            Arc::new(move |_: Option<SlaveAddress>, data: bytes::Bytes| {
                echoes.echoed.fetch_add(1, Ordering::Relaxed);
                debug!(%address, size = data.len(), "Echo received");
            }),
        )?;
        slaves.push(Arc::new(slave));
    }

    info!(slaves = options.slaves, "Waiting for discovery");
    master
        .await_ready(options.ready_timeout)
        .await
        .context("master did not finish discovery")?;
    try_join_all(slaves.iter().map(|s| s.await_ready(options.ready_timeout)))
        .await
        .context("slave did not register")?;
    info!(registered = master.slaves().len(), "Bus ready");

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push({
        let master = master.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbox_rx.recv().await {
                let Some(sender) = frame.sender else {
                    continue;
                };
                if let Err(e) = master.transmit_frame(frame.data, Some(sender)) {
                    warn!(%sender, error = %e, "Failed to echo payload");
                }
            }
        })
    });

    for slave in &slaves {
        tasks.push(spawn_telemetry(
            slave.clone(),
            options.telemetry_interval,
            counters.clone(),
        ));
    }

    tokio::time::sleep(options.duration).await;

    for task in &tasks {
        task.abort();
    }
    let report = SimulationReport {
        registered: master.slaves().len(),
        telemetry_sent: counters.sent.load(Ordering::Relaxed),
        telemetry_dropped: counters.dropped.load(Ordering::Relaxed),
        echoes_received: counters.echoed.load(Ordering::Relaxed),
        master: master.stats(),
    };

    for slave in &slaves {
        slave.shutdown();
    }
    master.shutdown();
    Ok(report)
}

fn spawn_telemetry(
    slave: Arc<SlaveHandle>,
    interval: Duration,
    counters: Arc<TrafficCounters>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seq: u64 = 0;
        loop {
            let jitter = {
                let mut rng = rand::thread_rng();
                let spread = interval.as_millis() as u64 / 2;
                Duration::from_millis(rng.gen_range(0..=spread))
            };
            tokio::time::sleep(interval / 2 + jitter).await;

            seq += 1;
            let payload = format!("{} seq={seq}", slave.address());
            match slave.transmit_frame(payload) {
                Ok(()) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(BusError::QueueFull { capacity }) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(address = %slave.address(), capacity, "Telemetry queue full");
                }
                Err(e) => {
                    warn!(address = %slave.address(), error = %e, "Telemetry rejected");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use btp_core::BusConfigBuilder;

    fn quick_options(slaves: usize) -> SimulationOptions {
        SimulationOptions {
            slaves,
            duration: Duration::from_secs(2),
            telemetry_interval: Duration::from_millis(200),
            ready_timeout: Duration::from_secs(5),
            config: BusConfigBuilder::new()
                .listen_period(Duration::from_millis(200))
                .response_margin(Duration::from_millis(50))
                .settle_period(Duration::from_millis(20))
                .build(),
        }
    }

    #[test]
    fn test_simulated_addresses() {
        assert_ne!(simulated_address(0), simulated_address(1));
        assert!(!simulated_address(1000).is_broadcast());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_round_trip() {
        let report = run(quick_options(2)).await.unwrap();

        assert_eq!(report.registered, 2);
        assert!(report.telemetry_sent > 0);
        assert!(report.echoes_received > 0);
        assert_eq!(report.master.rediscoveries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_without_slaves() {
        let report = run(quick_options(0)).await.unwrap();
        assert_eq!(report.registered, 0);
        assert_eq!(report.telemetry_sent, 0);
    }

    #[test]
    fn test_report_display() {
        let report = SimulationReport {
            registered: 3,
            telemetry_sent: 10,
            telemetry_dropped: 0,
            echoes_received: 9,
            master: BusStats::default(),
        };
        let text = report.to_string();
        assert!(text.starts_with("slaves=3"));
        assert!(text.contains("echoes_received=9"));
    }
}
