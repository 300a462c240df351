//! Render port allocation.
//!
//! Ports come from `[base, base + limit)`. Released ports go to a free set
//! and are reused smallest-first; otherwise a cursor walks the range once.
//! A port is handed out only if the probe says the OS will let us bind it.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use tracing::debug;

use crate::error::{HostError, HostResult};

/// Leases render ports out of a fixed range.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    end: u32,
    cursor: u32,
    free: BTreeSet<u16>,
    leased: BTreeSet<u16>,
}

impl PortAllocator {
    /// Allocator over `limit` ports starting at `base`.
    #[must_use]
    pub fn new(base: u16, limit: u16) -> Self {
        let end = (u32::from(base) + u32::from(limit)).min(u32::from(u16::MAX) + 1);
        Self {
            base,
            end,
            cursor: u32::from(base),
            free: BTreeSet::new(),
            leased: BTreeSet::new(),
        }
    }

    /// Lease a port whose bind probe succeeds.
    ///
    /// # Errors
    ///
    /// [`HostError::PortExhaustion`] when no port in the range is usable.
    pub fn allocate(&mut self) -> HostResult<u16> {
        self.allocate_with(port_is_bindable)
    }

    /// Like [`allocate`](Self::allocate) with a custom availability probe.
    ///
    /// # Errors
    ///
    /// [`HostError::PortExhaustion`] when no port in the range is usable.
    pub fn allocate_with(&mut self, mut probe: impl FnMut(u16) -> bool) -> HostResult<u16> {
        let reusable = self.free.iter().copied().find(|port| probe(*port));
        if let Some(port) = reusable {
            self.free.remove(&port);
            return Ok(self.lease(port));
        }

        while self.cursor < self.end {
            let Ok(port) = u16::try_from(self.cursor) else {
                break;
            };
            self.cursor += 1;
            if self.leased.contains(&port) {
                continue;
            }
            if probe(port) {
                return Ok(self.lease(port));
            }
            debug!(port, "Render port busy, skipping");
        }

        Err(HostError::PortExhaustion {
            base: self.base,
            end: self.end,
        })
    }

    /// Return a port to the pool. Ports that are not leased are ignored.
    pub fn release(&mut self, port: u16) {
        if self.leased.remove(&port) {
            self.free.insert(port);
            debug!(port, "Released render port");
        }
    }

    /// Ports currently leased, ascending.
    #[must_use]
    pub fn in_use(&self) -> Vec<u16> {
        self.leased.iter().copied().collect()
    }

    fn lease(&mut self, port: u16) -> u16 {
        self.leased.insert(port);
        debug!(port, "Leased render port");
        port
    }
}

fn port_is_bindable(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_port_is_reused_first() {
        let mut ports = PortAllocator::new(4100, 4);
        assert_eq!(ports.allocate_with(|_| true).unwrap(), 4100);
        assert_eq!(ports.allocate_with(|_| true).unwrap(), 4101);
        ports.release(4100);
        assert_eq!(ports.allocate_with(|_| true).unwrap(), 4100);
        assert_eq!(ports.allocate_with(|_| true).unwrap(), 4102);
        assert_eq!(ports.in_use(), vec![4100, 4101, 4102]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ports = PortAllocator::new(4100, 2);
        let port = ports.allocate_with(|_| true).unwrap();
        ports.release(port);
        ports.release(port);
        assert_eq!(ports.allocate_with(|_| true).unwrap(), port);
        assert_eq!(ports.allocate_with(|_| true).unwrap(), 4101);
        assert!(ports.allocate_with(|_| true).is_err());
    }

    #[test]
    fn test_skips_busy_ports() {
        let mut ports = PortAllocator::new(4100, 3);
        assert_eq!(ports.allocate_with(|p| p != 4100).unwrap(), 4101);
    }

    #[test]
    fn test_exhaustion() {
        let mut ports = PortAllocator::new(4100, 2);
        ports.allocate_with(|_| true).unwrap();
        ports.allocate_with(|_| true).unwrap();
        let err = ports.allocate_with(|_| true).unwrap_err();
        assert!(matches!(
            err,
            HostError::PortExhaustion {
                base: 4100,
                end: 4102
            }
        ));
    }

    #[test]
    fn test_range_clipped_at_u16_max() {
        let mut ports = PortAllocator::new(u16::MAX, 4);
        assert_eq!(ports.allocate_with(|_| true).unwrap(), u16::MAX);
        assert!(ports.allocate_with(|_| true).is_err());
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut ports = PortAllocator::new(4100, 1);
        ports.release(9999);
        assert!(ports.in_use().is_empty());
    }

    #[test]
    fn test_real_probe_skips_bound_port() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let mut ports = PortAllocator::new(port, 1);
        assert!(ports.allocate().is_err());
    }
}
