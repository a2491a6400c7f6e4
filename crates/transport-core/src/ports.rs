//! Port range allocation
//!
//! The manager carries three of these (signalling TCP, signalling UDP and
//! RTP/UDP media). Allocation is round-robin inside the configured range;
//! when every port in the range is in use the allocator fails rather than
//! falling back to an ephemeral port.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Inclusive range of ports with round-robin allocation
#[derive(Debug, Clone)]
pub struct PortRange {
    inner: Arc<Mutex<PortRangeInner>>,
}

#[derive(Debug)]
struct PortRangeInner {
    base: u16,
    max: u16,
    next: u16,
    in_use: HashSet<u16>,
}

impl PortRange {
    /// Create a range covering `base..=max`. A zero base disables the
    /// range: allocation then yields port 0 (kernel assigned).
    pub fn new(base: u16, max: u16) -> Self {
        let max = if max < base { base } else { max };
        Self {
            inner: Arc::new(Mutex::new(PortRangeInner {
                base,
                max,
                next: base,
                in_use: HashSet::new(),
            })),
        }
    }

    /// First port of the range
    pub fn base(&self) -> u16 {
        self.inner.lock().base
    }

    /// Last port of the range
    pub fn max(&self) -> u16 {
        self.inner.lock().max
    }

    /// Number of ports currently allocated
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use.len()
    }

    /// Allocate the next free port.
    ///
    /// Returns `PortRangeExhausted` once every port in the range is taken;
    /// the caller surfaces this as a transport error.
    pub fn allocate(&self) -> Result<AllocatedPort> {
        let mut inner = self.inner.lock();

        if inner.base == 0 {
            return Ok(AllocatedPort { port: 0, range: None });
        }

        let span = (inner.max - inner.base) as usize + 1;
        let mut candidate = inner.next;
        for _ in 0..span {
            if !inner.in_use.contains(&candidate) {
                inner.in_use.insert(candidate);
                inner.next = if candidate >= inner.max { inner.base } else { candidate + 1 };
                return Ok(AllocatedPort { port: candidate, range: Some(self.clone()) });
            }
            candidate = if candidate >= inner.max { inner.base } else { candidate + 1 };
        }

        Err(Error::PortRangeExhausted { base: inner.base, max: inner.max })
    }

    /// Allocate an even/odd port pair for an RTP/RTCP socket couple.
    ///
    /// RTP convention puts data on the even port and control on odd.
    pub fn allocate_pair(&self) -> Result<(AllocatedPort, AllocatedPort)> {
        let mut held = Vec::new();
        loop {
            let data = self.allocate()?;
            if data.port() == 0 {
                // Kernel assigned; no pairing possible, take two singles
                let ctrl = self.allocate()?;
                return Ok((data, ctrl));
            }
            if data.port() % 2 == 0 {
                match self.try_specific(data.port() + 1) {
                    Some(ctrl) => return Ok((data, ctrl)),
                    None => held.push(data), // Odd partner taken, keep looking
                }
            } else {
                held.push(data);
            }
            if held.len() > 1024 {
                let inner = self.inner.lock();
                return Err(Error::PortRangeExhausted { base: inner.base, max: inner.max });
            }
        }
        // `held` drops here releasing the unpaired ports
    }

    fn try_specific(&self, port: u16) -> Option<AllocatedPort> {
        let mut inner = self.inner.lock();
        if port < inner.base || port > inner.max || inner.in_use.contains(&port) {
            return None;
        }
        inner.in_use.insert(port);
        Some(AllocatedPort { port, range: Some(self.clone()) })
    }

    fn release(&self, port: u16) {
        self.inner.lock().in_use.remove(&port);
    }
}

impl Default for PortRange {
    fn default() -> Self {
        // Matches the historical default RTP media range
        Self::new(5000, 5999)
    }
}

/// RAII handle for a port; the port returns to the range on drop
#[derive(Debug)]
pub struct AllocatedPort {
    port: u16,
    range: Option<PortRange>,
}

impl AllocatedPort {
    /// The allocated port number (0 when the range is disabled)
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for AllocatedPort {
    fn drop(&mut self) {
        if let Some(range) = self.range.take() {
            range.release(self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let range = PortRange::new(6000, 6003);
        let a = range.allocate().unwrap();
        let b = range.allocate().unwrap();
        assert_eq!(a.port(), 6000);
        assert_eq!(b.port(), 6001);
    }

    #[test]
    fn test_exhaustion_and_release() {
        let range = PortRange::new(7000, 7001);
        let a = range.allocate().unwrap();
        let _b = range.allocate().unwrap();
        assert!(matches!(
            range.allocate(),
            Err(Error::PortRangeExhausted { base: 7000, max: 7001 })
        ));

        drop(a);
        let c = range.allocate().unwrap();
        assert_eq!(c.port(), 7000);
    }

    #[test]
    fn test_disabled_range_yields_zero() {
        let range = PortRange::new(0, 0);
        assert_eq!(range.allocate().unwrap().port(), 0);
        assert_eq!(range.allocate().unwrap().port(), 0);
    }

    #[test]
    fn test_pair_allocation_even_odd() {
        let range = PortRange::new(8000, 8009);
        let (data, ctrl) = range.allocate_pair().unwrap();
        assert_eq!(data.port() % 2, 0);
        assert_eq!(ctrl.port(), data.port() + 1);
    }

    #[test]
    fn test_pair_skips_taken_odd() {
        let range = PortRange::new(8000, 8005);
        let _odd = range.try_specific(8001).unwrap();
        let (data, ctrl) = range.allocate_pair().unwrap();
        assert_eq!(data.port(), 8002);
        assert_eq!(ctrl.port(), 8003);
    }
}
