//! Configuration types for the bus transceiver
//!
//! This module provides the timing, discovery and queue settings shared by
//! the master and slave roles, plus the protocol constants.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BusError, Result};
use crate::wire;

/// Error count above which a slave is considered lost
pub const MAX_SLAVE_ERRORS: u32 = 10;

/// Payload size above which the master uses the bulk ack timeout
pub const BULK_PAYLOAD_THRESHOLD: usize = 1000;

/// Default baud rate for serial bus adapters
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default capacity of the outbound application queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Default capacity of the transport → engine reception channel
pub const DEFAULT_RECEIVE_CAPACITY: usize = 64;

/// Main configuration for a bus role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Transmit, acknowledgement and polling timeouts
    #[serde(default)]
    pub timing: TimingConfig,

    /// Discovery phase settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Queue sizing
    #[serde(default)]
    pub queue: QueueConfig,

    /// Timeouts tolerated per slave before re-discovery
    #[serde(default = "default_max_slave_errors")]
    pub max_slave_errors: u32,
}

fn default_max_slave_errors() -> u32 {
    MAX_SLAVE_ERRORS
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            discovery: DiscoveryConfig::default(),
            queue: QueueConfig::default(),
            max_slave_errors: MAX_SLAVE_ERRORS,
        }
    }
}

impl BusConfig {
    /// Check that the timing values are consistent with each other
    pub fn validate(&self) -> Result<()> {
        if self.discovery.response_margin >= self.discovery.listen_period {
            return Err(BusError::InvalidConfig(format!(
                "discovery response margin {:?} must be shorter than listen period {:?}",
                self.discovery.response_margin, self.discovery.listen_period
            )));
        }

        if self.timing.active_window >= self.timing.ack_timeout {
            return Err(BusError::InvalidConfig(format!(
                "slave active window {:?} must be shorter than ack timeout {:?}",
                self.timing.active_window, self.timing.ack_timeout
            )));
        }

        if self.timing.bulk_ack_timeout < self.timing.ack_timeout {
            return Err(BusError::InvalidConfig(
                "bulk ack timeout must not be shorter than ack timeout".to_string(),
            ));
        }

        if self.timing.line_rate == 0 {
            return Err(BusError::InvalidConfig("line rate must be non-zero".to_string()));
        }

        if self.queue.capacity == 0 || self.queue.receive_capacity == 0 {
            return Err(BusError::InvalidConfig(
                "queue capacities must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Upper bound on how long flushing `wire_len` sealed bytes may block
    pub fn flush_budget(&self, wire_len: usize) -> Duration {
        self.timing.write_timeout + self.timing.echo_timeout_for(wire_len)
    }
}

/// Timeouts governing a single bus turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Bound on transmit completion
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,

    /// Bound on observing our own frame echoed back, on top of its transfer time
    #[serde(with = "humantime_serde", default = "default_echo_timeout")]
    pub echo_timeout: Duration,

    /// Bus line rate in baud, used to size the echo wait
    #[serde(default = "default_line_rate")]
    pub line_rate: u32,

    /// How long the master waits for a slave to hand the bus back
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,

    /// Ack timeout used after sending a bulk payload
    #[serde(with = "humantime_serde", default = "default_bulk_ack_timeout")]
    pub bulk_ack_timeout: Duration,

    /// Payload size that selects the bulk ack timeout
    #[serde(default = "default_bulk_threshold")]
    pub bulk_threshold: usize,

    /// Silence after which the master addresses a slave out of turn
    #[serde(with = "humantime_serde", default = "default_keepalive_window")]
    pub keepalive_window: Duration,

    /// Longest a slave may hold the bus once addressed
    #[serde(with = "humantime_serde", default = "default_active_window")]
    pub active_window: Duration,

    /// How long a slave waits for queued data before acknowledging
    #[serde(with = "humantime_serde", default = "default_queue_wait")]
    pub queue_wait: Duration,

    /// Master back-off when there is no slave to poll
    #[serde(with = "humantime_serde", default = "default_idle_interval")]
    pub idle_interval: Duration,
}

fn default_write_timeout() -> Duration {
    Duration::from_millis(50)
}

fn default_echo_timeout() -> Duration {
    Duration::from_millis(50)
}

fn default_line_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_ack_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_bulk_ack_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_bulk_threshold() -> usize {
    BULK_PAYLOAD_THRESHOLD
}

fn default_keepalive_window() -> Duration {
    Duration::from_secs(1)
}

fn default_active_window() -> Duration {
    Duration::from_millis(80)
}

fn default_queue_wait() -> Duration {
    Duration::from_millis(10)
}

fn default_idle_interval() -> Duration {
    Duration::from_millis(50)
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            write_timeout: default_write_timeout(),
            echo_timeout: default_echo_timeout(),
            line_rate: DEFAULT_BAUD_RATE,
            ack_timeout: default_ack_timeout(),
            bulk_ack_timeout: default_bulk_ack_timeout(),
            bulk_threshold: BULK_PAYLOAD_THRESHOLD,
            keepalive_window: default_keepalive_window(),
            active_window: default_active_window(),
            queue_wait: default_queue_wait(),
            idle_interval: default_idle_interval(),
        }
    }
}

impl TimingConfig {
    /// Echo wait for a sealed frame of `wire_len` bytes
    pub fn echo_timeout_for(&self, wire_len: usize) -> Duration {
        self.echo_timeout + wire::transfer_time(wire_len + wire::STREAM_HEADER_LEN, self.line_rate)
    }

    /// Ack timeout to apply after sending `payload_len` bytes
    pub fn ack_timeout_for(&self, payload_len: usize) -> Duration {
        if payload_len > self.bulk_threshold {
            self.bulk_ack_timeout
        } else {
            self.ack_timeout
        }
    }
}

/// Discovery phase settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// How long the master collects DISCOVER replies
    #[serde(with = "humantime_serde", default = "default_listen_period")]
    pub listen_period: Duration,

    /// Gap between consecutive DISCOVER_FIN frames
    #[serde(with = "humantime_serde", default = "default_fin_interval")]
    pub fin_interval: Duration,

    /// Wait before sampling the status line
    #[serde(with = "humantime_serde", default = "default_settle_period")]
    pub settle_period: Duration,

    /// Part of the listen period a slave never replies in
    #[serde(with = "humantime_serde", default = "default_response_margin")]
    pub response_margin: Duration,

    /// Failed discovery cycles tolerated before going READY anyway (0 = retry forever)
    #[serde(default)]
    pub max_attempts: u32,

    /// Pause between a failed discovery cycle and the next one
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,
}

fn default_listen_period() -> Duration {
    Duration::from_secs(1)
}

fn default_fin_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_settle_period() -> Duration {
    Duration::from_millis(100)
}

fn default_response_margin() -> Duration {
    Duration::from_millis(200)
}

fn default_retry_delay() -> Duration {
    Duration::ZERO
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listen_period: default_listen_period(),
            fin_interval: default_fin_interval(),
            settle_period: default_settle_period(),
            response_margin: default_response_margin(),
            max_attempts: 0, // Infinite
            retry_delay: Duration::ZERO,
        }
    }
}

impl DiscoveryConfig {
    /// Window in which a slave picks its random reply delay
    pub fn response_window(&self) -> Duration {
        self.listen_period.saturating_sub(self.response_margin)
    }
}

/// Queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Outbound application frames held per role
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Received frames buffered between transport and engine
    #[serde(default = "default_receive_capacity")]
    pub receive_capacity: usize,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_receive_capacity() -> usize {
    DEFAULT_RECEIVE_CAPACITY
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            receive_capacity: DEFAULT_RECEIVE_CAPACITY,
        }
    }
}

/// Builder for BusConfig
#[derive(Debug, Default)]
pub struct BusConfigBuilder {
    config: BusConfig,
}

impl BusConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the master ack timeout
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.timing.ack_timeout = timeout;
        self
    }

    /// Set the keep-alive window
    pub fn keepalive_window(mut self, window: Duration) -> Self {
        self.config.timing.keepalive_window = window;
        self
    }

    /// Set the slave active window
    pub fn active_window(mut self, window: Duration) -> Self {
        self.config.timing.active_window = window;
        self
    }

    /// Set write and echo timeouts
    pub fn flush_timeouts(mut self, write: Duration, echo: Duration) -> Self {
        self.config.timing.write_timeout = write;
        self.config.timing.echo_timeout = echo;
        self
    }

    /// Set the bus line rate
    pub fn line_rate(mut self, baud: u32) -> Self {
        self.config.timing.line_rate = baud;
        self
    }

    /// Set the discovery listen period
    pub fn listen_period(mut self, period: Duration) -> Self {
        self.config.discovery.listen_period = period;
        self
    }

    /// Set the slave reply safety margin
    pub fn response_margin(mut self, margin: Duration) -> Self {
        self.config.discovery.response_margin = margin;
        self
    }

    /// Set the discovery settle period
    pub fn settle_period(mut self, period: Duration) -> Self {
        self.config.discovery.settle_period = period;
        self
    }

    /// Bound the number of failed discovery cycles
    pub fn discovery_retries(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.config.discovery.max_attempts = max_attempts;
        self.config.discovery.retry_delay = retry_delay;
        self
    }

    /// Set the outbound queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue.capacity = capacity;
        self
    }

    /// Set the per-slave error threshold
    pub fn max_slave_errors(mut self, max: u32) -> Self {
        self.config.max_slave_errors = max;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BusConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
