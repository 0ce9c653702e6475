//! Slave registry kept by the master
//!
//! Entries are created during discovery and live until the next transition
//! into INITIAL, which clears the registry wholesale. A slave that keeps
//! timing out is never evicted individually; once its error count passes the
//! threshold the master re-runs discovery instead.
//!
//! Insertion order is the round-robin polling order.

use tokio::time::Instant;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::MAX_SLAVE_ERRORS;
use crate::frame::SlaveAddress;

/// One registered slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveEntry {
    /// Slave address
    pub address: SlaveAddress,
    /// Last time this slave was heard from or addressed with data
    pub last_message: Instant,
    /// Consecutive communication timeouts
    pub error_count: u32,
}

impl SlaveEntry {
    fn new(address: SlaveAddress, now: Instant) -> Self {
        Self {
            address,
            last_message: now,
            error_count: 0,
        }
    }
}

/// Ordered set of known slaves with per-slave health
#[derive(Debug)]
pub struct SlaveRegistry {
    entries: Vec<SlaveEntry>,
    cursor: usize,
    max_errors: u32,
}

impl SlaveRegistry {
    /// Create an empty registry with the default error threshold
    pub fn new() -> Self {
        Self::with_max_errors(MAX_SLAVE_ERRORS)
    }

    /// Create an empty registry with a custom error threshold
    pub fn with_max_errors(max_errors: u32) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            max_errors,
        }
    }

    /// Register a slave or refresh an existing entry
    ///
    /// Returns `true` if the address was new. The broadcast address is never
    /// registered.
    pub fn add_or_refresh(&mut self, address: SlaveAddress, now: Instant) -> bool {
        if address.is_broadcast() {
            debug!("Ignoring broadcast address in slave registry");
            return false;
        }

        if let Some(entry) = self.get_mut(address) {
            entry.last_message = now;
            entry.error_count = 0;
            trace!(%address, "Refreshed slave entry");
            return false;
        }

        self.entries.push(SlaveEntry::new(address, now));
        debug!(%address, total = self.entries.len(), "Registered slave");
        true
    }

    /// Whether the address is registered
    pub fn contains(&self, address: SlaveAddress) -> bool {
        self.get(address).is_some()
    }

    /// Look up an entry
    pub fn get(&self, address: SlaveAddress) -> Option<&SlaveEntry> {
        self.entries.iter().find(|e| e.address == address)
    }

    fn get_mut(&mut self, address: SlaveAddress) -> Option<&mut SlaveEntry> {
        self.entries.iter_mut().find(|e| e.address == address)
    }

    /// Successful exchange: reset the error count and refresh the timestamp
    pub fn record_success(&mut self, address: SlaveAddress, now: Instant) -> bool {
        match self.get_mut(address) {
            Some(entry) => {
                entry.last_message = now;
                entry.error_count = 0;
                true
            }
            None => false,
        }
    }

    /// Communication timeout: returns the new error count
    pub fn record_timeout(&mut self, address: SlaveAddress) -> Option<u32> {
        let entry = self.get_mut(address)?;
        entry.error_count = entry.error_count.saturating_add(1);
        trace!(%address, errors = entry.error_count, "Slave timeout recorded");
        Some(entry.error_count)
    }

    /// Note that data was just sent to the slave
    pub fn touch(&mut self, address: SlaveAddress, now: Instant) {
        if let Some(entry) = self.get_mut(address) {
            entry.last_message = now;
        }
    }

    /// Whether the slave has passed the error threshold
    pub fn is_exhausted(&self, address: SlaveAddress) -> bool {
        self.get(address)
            .is_some_and(|e| e.error_count > self.max_errors)
    }

    /// The slave silent for longest, if it has been silent longer than `window`
    pub fn stalest(&self, now: Instant, window: Duration) -> Option<SlaveAddress> {
        self.entries
            .iter()
            .filter(|e| now.saturating_duration_since(e.last_message) > window)
            .min_by_key(|e| e.last_message)
            .map(|e| e.address)
    }

    /// Next slave in round-robin order
    pub fn next_round_robin(&mut self) -> Option<SlaveAddress> {
        if self.entries.is_empty() {
            return None;
        }
        if self.cursor >= self.entries.len() {
            self.cursor = 0;
        }
        let address = self.entries[self.cursor].address;
        self.cursor = (self.cursor + 1) % self.entries.len();
        Some(address)
    }

    /// The slave heard from most recently
    pub fn most_recent(&self) -> Option<SlaveAddress> {
        self.entries
            .iter()
            .max_by_key(|e| e.last_message)
            .map(|e| e.address)
    }

    /// Registered addresses in polling order
    pub fn addresses(&self) -> Vec<SlaveAddress> {
        self.entries.iter().map(|e| e.address).collect()
    }

    /// Copy of all entries
    pub fn entries(&self) -> Vec<SlaveEntry> {
        self.entries.clone()
    }

    /// Forget every slave
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!(dropped = self.entries.len(), "Cleared slave registry");
        }
        self.entries.clear();
        self.cursor = 0;
    }

    /// Number of registered slaves
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no slave is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Error threshold
    pub fn max_errors(&self) -> u32 {
        self.max_errors
    }
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: SlaveAddress = SlaveAddress::new(0x1111_1111_1111_1111);
    const B: SlaveAddress = SlaveAddress::new(0x2222_2222_2222_2222);
    const C: SlaveAddress = SlaveAddress::new(0x3333_3333_3333_3333);

    #[test]
    fn test_add_and_refresh() {
        let mut registry = SlaveRegistry::new();
        let now = Instant::now();
        assert!(registry.add_or_refresh(A, now));
        assert!(!registry.add_or_refresh(A, now));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_never_registered() {
        let mut registry = SlaveRegistry::new();
        assert!(!registry.add_or_refresh(SlaveAddress::BROADCAST, Instant::now()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_round_robin_two_slaves() {
        let mut registry = SlaveRegistry::new();
        let now = Instant::now();
        registry.add_or_refresh(A, now);
        registry.add_or_refresh(B, now);

        let first = registry.next_round_robin().unwrap();
        let second = registry.next_round_robin().unwrap();
        assert_ne!(first, second);
        assert!([A, B].contains(&first));
        assert!([A, B].contains(&second));
    }

    #[test]
    fn test_round_robin_fairness() {
        let mut registry = SlaveRegistry::new();
        let now = Instant::now();
        for addr in [A, B, C] {
            registry.add_or_refresh(addr, now);
        }

        let polls = 100;
        let mut counts = std::collections::HashMap::new();
        for _ in 0..polls {
            *counts.entry(registry.next_round_robin().unwrap()).or_insert(0) += 1;
        }
        for addr in [A, B, C] {
            assert!(counts[&addr] >= polls / 3);
        }
    }

    #[test]
    fn test_error_threshold() {
        let mut registry = SlaveRegistry::new();
        registry.add_or_refresh(A, Instant::now());

        for _ in 0..MAX_SLAVE_ERRORS {
            registry.record_timeout(A);
        }
        assert!(!registry.is_exhausted(A));

        registry.record_timeout(A);
        assert!(registry.is_exhausted(A));

        registry.record_success(A, Instant::now());
        assert!(!registry.is_exhausted(A));
        assert_eq!(registry.get(A).unwrap().error_count, 0);
    }

    #[test]
    fn test_stalest_respects_window() {
        let mut registry = SlaveRegistry::new();
        let t0 = Instant::now();
        registry.add_or_refresh(A, t0);
        registry.add_or_refresh(B, t0 + Duration::from_millis(500));

        let window = Duration::from_secs(1);
        assert_eq!(registry.stalest(t0 + Duration::from_millis(900), window), None);
        assert_eq!(
            registry.stalest(t0 + Duration::from_millis(1200), window),
            Some(A)
        );
        assert_eq!(registry.most_recent(), Some(B));
    }

    #[test]
    fn test_clear_resets_cursor() {
        let mut registry = SlaveRegistry::new();
        let now = Instant::now();
        registry.add_or_refresh(A, now);
        registry.add_or_refresh(B, now);
        registry.next_round_robin();
        registry.clear();
        assert!(registry.next_round_robin().is_none());

        registry.add_or_refresh(C, now);
        assert_eq!(registry.next_round_robin(), Some(C));
    }
}
