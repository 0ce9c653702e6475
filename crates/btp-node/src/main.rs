//! BTP Node - run a Bus Transceiver Protocol master or slave
//!
//! Subcommands:
//! - `simulate`: a master and N slaves on an in-memory bus
//! - `serial`: one role on a real serial bus (requires the `serial` feature)

mod simulate;

#[cfg(feature = "serial")]
mod serial;

use anyhow::Context;
use btp_core::BusConfig;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "btp-node")]
#[command(about = "Bus Transceiver Protocol node")]
struct Args {
    /// JSON configuration file (timings, discovery, queue sizes)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a master and simulated slaves on an in-memory bus
    Simulate {
        /// Number of slaves
        #[arg(long, default_value_t = 3)]
        slaves: usize,

        /// How long to run
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        duration: Duration,

        /// Interval between telemetry frames sent by each slave
        #[arg(long, default_value = "250ms", value_parser = humantime::parse_duration)]
        telemetry_interval: Duration,

        /// How long to wait for discovery to finish
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        ready_timeout: Duration,
    },

    /// Run one role on a serial bus
    #[cfg(feature = "serial")]
    Serial {
        /// Data port (e.g. /dev/ttyUSB0)
        #[arg(long)]
        port: String,

        /// Control port carrying the status line on RTS/CTS
        #[arg(long)]
        status_port: String,

        /// Baud rate
        #[arg(long, default_value_t = btp_core::DEFAULT_BAUD_RATE)]
        baud: u32,

        /// Role on the bus
        #[arg(long, value_enum)]
        role: serial::Role,

        /// 64-bit device address (hex with 0x prefix, or decimal)
        #[arg(long)]
        id: btp_core::SlaveAddress,
    },
}

/// Load and validate the bus configuration
fn load_config(path: Option<&Path>) -> anyhow::Result<BusConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => BusConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Simulate {
            slaves,
            duration,
            telemetry_interval,
            ready_timeout,
        } => {
            let options = simulate::SimulationOptions {
                slaves,
                duration,
                telemetry_interval,
                ready_timeout,
                config,
            };
            let report = tokio::select! {
                report = simulate::run(options) => report?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    return Ok(());
                }
            };
            info!("{report}");
        }
        #[cfg(feature = "serial")]
        Command::Serial {
            port,
            status_port,
            baud,
            role,
            id,
        } => {
            serial::run(serial::SerialOptions {
                port,
                status_port,
                baud,
                role,
                id,
                config,
            })
            .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_simulate_args() {
        let args = Args::try_parse_from([
            "btp-node",
            "--verbose",
            "simulate",
            "--slaves",
            "5",
            "--duration",
            "3s",
        ])
        .unwrap();

        assert!(args.verbose);
        match args.command {
            Command::Simulate {
                slaves,
                duration,
                telemetry_interval,
                ..
            } => {
                assert_eq!(slaves, 5);
                assert_eq!(duration, Duration::from_secs(3));
                assert_eq!(telemetry_interval, Duration::from_millis(250));
            }
            #[allow(unreachable_patterns)]
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_rejects_bad_duration() {
        assert!(Args::try_parse_from(["btp-node", "simulate", "--duration", "soon"]).is_err());
    }

    #[test]
    fn test_load_default_config() {
        let config = load_config(None).unwrap();
        assert_eq!(config.max_slave_errors, btp_core::MAX_SLAVE_ERRORS);
    }

    #[test]
    fn test_load_config_file() {
        let path = std::env::temp_dir().join(format!("btp-node-config-{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"timing":{{"ack_timeout":"150ms"}},"max_slave_errors":3}}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.timing.ack_timeout, Duration::from_millis(150));
        assert_eq!(config.max_slave_errors, 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let path = std::env::temp_dir().join(format!("btp-node-invalid-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"queue":{"capacity":0}}"#).unwrap();

        let result = load_config(Some(&path));
        std::fs::remove_file(&path).unwrap();

        assert!(result.is_err());
    }
}
