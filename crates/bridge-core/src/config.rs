//! Configuration types for the bridge.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Inclusive range of UDP ports the allocator may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end, "port range start must not exceed end");
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

impl Default for PortRange {
    fn default() -> Self {
        // Default dynamic media range, clear of the well-known SIP/RTP ports.
        Self {
            start: 10_000,
            end: 20_000,
        }
    }
}

/// How the allocator picks candidate ports from the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Scan upward from the start of the range.
    Sequential,
    /// Pick random candidates, falling back to a sequential scan.
    Random,
}

/// Configuration for the port allocator.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Range ports are drawn from.
    pub port_range: PortRange,
    /// Candidate selection strategy.
    pub strategy: AllocationStrategy,
    /// Probe-bind each candidate before reserving it, so a port already in
    /// use by another process is never handed out.
    pub bind_verify: bool,
    /// Local address used for probe binds.
    pub local_ip: IpAddr,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            strategy: AllocationStrategy::Sequential,
            bind_verify: true,
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Configuration for a session's ingress pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Upper bound on a single receive wait. Keeps the pump responsive to
    /// teardown even when no packets arrive.
    pub recv_timeout: Duration,
    /// Maximum payload size relayed; larger packets are dropped.
    pub max_packet_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(250),
            max_packet_size: 1500, // standard MTU
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub allocator: AllocatorConfig,
    pub pump: PumpConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_bounds() {
        let range = PortRange::new(5000, 5004);
        assert_eq!(range.len(), 5);
        assert!(range.contains(5000));
        assert!(range.contains(5004));
        assert!(!range.contains(5005));
    }
}
