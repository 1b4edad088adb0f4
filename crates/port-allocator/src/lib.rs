//! CLB Port Allocator
//!
//! In-memory allocation engine that maps listener ports on cloud load
//! balancers to port bindings.
//!
//! # Layout
//!
//! - [`protocol`]: `Protocol`, `ProtocolPort` and `LbKey` value types
//! - [`pool`]: a single `PortPool` and its allocation cache
//! - [`pools`]: composition of several pools for one request
//! - [`allocator`]: the `PortAllocator` registry used by reconcilers
//!
//! # Example
//!
//! ```
//! use port_allocator::{PortAllocator, PoolConfig, PoolState, Protocol};
//!
//! let allocator = PortAllocator::new();
//! let mut config = PoolConfig::new("game", "ap-guangzhou", 30000);
//! config.end_port = 30100;
//! config.listener_quota = Some(50);
//!
//! let pool = allocator.add_pool(config);
//! pool.ensure_lb_ids(&["lb-1".to_string()]);
//! pool.set_state(PoolState::Active);
//!
//! let allocated = allocator
//!     .allocate(&["game".to_string()], Protocol::TcpUdp, false)
//!     .unwrap();
//! assert_eq!(allocated.len(), 2);
//! allocated.release();
//! ```

pub mod allocator;
pub mod error;
pub mod pool;
pub mod pools;
pub mod protocol;

pub use allocator::PortAllocator;
pub use error::AllocError;
pub use pool::{LbPolicy, PoolConfig, PoolState, PortAllocation, PortAllocations, PortPool};
pub use pools::PortPools;
pub use protocol::{port_units, LbKey, Protocol, ProtocolPort};
