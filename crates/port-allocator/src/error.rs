//! Allocation errors

use thiserror::Error;

use crate::pool::PoolState;

/// Errors returned by the port allocator.
///
/// Configuration errors need operator intervention; capacity errors
/// ([`NoPortAvailable`](AllocError::NoPortAvailable) and
/// [`WaitLbScale`](AllocError::WaitLbScale)) clear up on their own once ports
/// are released or load balancers are added.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// A requested pool is not registered
    #[error("port pool {0} not found")]
    PoolNotFound(String),

    /// Pools of one request use different segment lengths
    #[error("segment length is not equal across port pools {0:?}")]
    SegmentLengthNotEqual(Vec<String>),

    /// Pools of one request use different listener quotas
    #[error("listener quota is not equal across port pools {0:?}")]
    QuotaNotEqual(Vec<String>),

    /// The pool's listener quota has not been resolved yet
    #[error("listener quota of port pool {0} is not known yet")]
    QuotaNotFound(String),

    /// The pool is not in an allocatable state
    #[error("port pool {0} is not allocatable (state {1})")]
    PortPoolNotAllocatable(String, PoolState),

    /// The port ranges of the requested pools do not overlap
    #[error("port ranges of pools {pools:?} have no intersection ({start} > {end})")]
    NoIntersection {
        /// Pools of the request
        pools: Vec<String>,
        /// Intersected start port
        start: u16,
        /// Intersected end port
        end: u16,
    },

    /// Every port in range is taken
    #[error("no port available in port pools {0:?}")]
    NoPortAvailable(Vec<String>),

    /// Every load balancer reached its listener quota
    #[error("all load balancers of port pools {0:?} reached the listener quota, waiting for scale-up")]
    WaitLbScale(Vec<String>),

    /// A request named no pools
    #[error("no port pool specified")]
    EmptyPools,

    /// Protocol string not understood
    #[error("unknown protocol {0}")]
    UnknownProtocol(String),
}

impl AllocError {
    /// Whether the error is expected to clear without operator action.
    pub fn is_capacity(&self) -> bool {
        matches!(self, AllocError::NoPortAvailable(_) | AllocError::WaitLbScale(_))
    }
}
