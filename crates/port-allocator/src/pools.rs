//! Allocation across several pools at once.

use std::sync::Arc;

use tracing::debug;

use crate::error::AllocError;
use crate::pool::{PortAllocations, PortPool};
use crate::protocol::{port_units, Protocol, ProtocolPort};

/// The pools named by one binding entry.
///
/// Every pool contributes one allocation (two for TCPUDP). Either all pools
/// succeed or nothing stays allocated.
#[derive(Debug, Clone)]
pub struct PortPools(Vec<Arc<PortPool>>);

/// Shared parameters of a set of pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Intersection {
    start: u16,
    end: u16,
    segment_length: u16,
    quota: usize,
}

impl PortPools {
    /// Wraps resolved pools.
    pub fn new(pools: Vec<Arc<PortPool>>) -> Self {
        Self(pools)
    }

    /// Pool names, in request order.
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|p| p.name().to_string()).collect()
    }

    fn intersect(&self) -> Result<Intersection, AllocError> {
        let first = self.0.first().ok_or(AllocError::EmptyPools)?;
        let segment_length = first.segment_length().max(1);
        if self.0.iter().any(|p| p.segment_length().max(1) != segment_length) {
            return Err(AllocError::SegmentLengthNotEqual(self.names()));
        }

        let mut quota = None;
        for pool in &self.0 {
            let state = pool.state();
            if !state.is_allocatable() {
                return Err(AllocError::PortPoolNotAllocatable(pool.name().to_string(), state));
            }
            let pool_quota = pool
                .quota()
                .ok_or_else(|| AllocError::QuotaNotFound(pool.name().to_string()))?;
            match quota {
                None => quota = Some(pool_quota),
                Some(q) if q != pool_quota => return Err(AllocError::QuotaNotEqual(self.names())),
                Some(_) => {}
            }
        }

        let start = self.0.iter().map(|p| p.start_port()).max().unwrap_or_default();
        let end = self.0.iter().map(|p| p.end_port()).min().unwrap_or_default();
        if start > end {
            return Err(AllocError::NoIntersection {
                pools: self.names(),
                start,
                end,
            });
        }

        Ok(Intersection {
            start,
            end,
            segment_length: first.segment_length(),
            quota: quota.unwrap_or_default(),
        })
    }

    /// Allocates `protocol` from every pool.
    ///
    /// With `use_same_port` every pool gets the same port number (or
    /// segment); otherwise each pool picks its own port inside the common
    /// range.
    pub fn allocate(&self, protocol: Protocol, use_same_port: bool) -> Result<PortAllocations, AllocError> {
        let range = self.intersect()?;
        if use_same_port {
            self.allocate_same_port(range, protocol)
        } else {
            self.allocate_independent(range, protocol)
        }
    }

    fn allocate_independent(&self, range: Intersection, protocol: Protocol) -> Result<PortAllocations, AllocError> {
        let mut result = PortAllocations::new();
        for pool in &self.0 {
            let (allocated, quota_exceeded) =
                pool.allocate_port_from_range(range.start, range.end, range.quota, range.segment_length, protocol);
            if allocated.is_empty() {
                result.release();
                return Err(if quota_exceeded {
                    AllocError::WaitLbScale(self.names())
                } else {
                    AllocError::NoPortAvailable(self.names())
                });
            }
            result.extend(allocated);
        }
        Ok(result)
    }

    fn allocate_same_port(&self, range: Intersection, protocol: Protocol) -> Result<PortAllocations, AllocError> {
        'candidate: for (port, end_port) in port_units(range.start, range.end, range.segment_length) {
            let units: Vec<ProtocolPort> = ProtocolPort::expand(port, end_port, protocol);
            let mut result = PortAllocations::new();
            for pool in &self.0 {
                let (allocated, quota_exceeded) = pool.allocate_port(range.quota, &units);
                if allocated.is_empty() {
                    result.release();
                    if quota_exceeded {
                        return Err(AllocError::WaitLbScale(self.names()));
                    }
                    debug!("Port {} taken in pool {}, trying next", port, pool.name());
                    continue 'candidate;
                }
                result.extend(allocated);
            }
            return Ok(result);
        }
        Err(AllocError::NoPortAvailable(self.names()))
    }
}
