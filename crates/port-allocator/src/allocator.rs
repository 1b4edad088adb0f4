//! Registry of port pools.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use crate::error::AllocError;
use crate::pool::{PoolConfig, PortAllocations, PortPool};
use crate::pools::PortPools;
use crate::protocol::{LbKey, Protocol, ProtocolPort};

/// Thread-safe map from pool name to pool.
///
/// Built once at startup and shared by `Arc` between every reconciler.
#[derive(Debug, Default)]
pub struct PortAllocator {
    pools: RwLock<HashMap<String, Arc<PortPool>>>,
}

impl PortAllocator {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pool, or updates the mutable settings of an existing one.
    ///
    /// Port range and segment length are fixed once a pool exists; a config
    /// that changes them is logged and only its quota and policy are applied.
    pub fn add_pool(&self, config: PoolConfig) -> Arc<PortPool> {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(&config.name) {
            if !pool.matches_range(&config) {
                warn!(
                    "Port pool {} range change to {}-{} (segment {}) ignored, range is fixed after creation",
                    config.name, config.start_port, config.end_port, config.segment_length
                );
            }
            if config.listener_quota.is_some() {
                pool.set_quota(config.listener_quota);
            }
            pool.set_policy(config.policy);
            return Arc::clone(pool);
        }

        info!(
            "Added port pool {} ({} {}-{}, segment {})",
            config.name, config.region, config.start_port, config.end_port, config.segment_length
        );
        let pool = Arc::new(PortPool::new(config));
        pools.insert(pool.name().to_string(), Arc::clone(&pool));
        pool
    }

    /// Removes a pool. Returns `false` if it was not registered.
    pub fn remove_pool(&self, name: &str) -> bool {
        let removed = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            info!("Removed port pool {}", name);
        }
        removed
    }

    /// Looks up a pool by name.
    pub fn pool(&self, name: &str) -> Option<Arc<PortPool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(Arc::clone)
    }

    /// Registered pool names, sorted.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn resolve(&self, names: &[String]) -> Result<PortPools, AllocError> {
        if names.is_empty() {
            return Err(AllocError::EmptyPools);
        }
        let registry = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        let pools = names
            .iter()
            .map(|name| {
                registry
                    .get(name)
                    .map(Arc::clone)
                    .ok_or_else(|| AllocError::PoolNotFound(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PortPools::new(pools))
    }

    /// Allocates `protocol` from every pool in `pools`.
    pub fn allocate(&self, pools: &[String], protocol: Protocol, use_same_port: bool) -> Result<PortAllocations, AllocError> {
        self.resolve(pools)?.allocate(protocol, use_same_port)
    }

    /// Frees one unit. Unknown pools are ignored.
    pub fn release(&self, pool: &str, lb: &LbKey, port: &ProtocolPort) {
        if let Some(pool) = self.pool(pool) {
            pool.release_port(lb, port);
        }
    }

    /// Records a unit persisted before this process started.
    ///
    /// Returns `Ok(false)` when the load balancer is not part of the pool.
    pub fn mark_allocated(&self, pool: &str, lb: &LbKey, port: &ProtocolPort) -> Result<bool, AllocError> {
        let pool = self.pool(pool).ok_or_else(|| AllocError::PoolNotFound(pool.to_string()))?;
        Ok(pool.mark_allocated(lb, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{LbPolicy, PoolState};

    fn registry() -> PortAllocator {
        let allocator = PortAllocator::new();
        let mut config = PoolConfig::new("pool-a", "ap-test", 30000);
        config.end_port = 30010;
        config.listener_quota = Some(10);
        let pool = allocator.add_pool(config);
        pool.ensure_lb_ids(&["lb-1".to_string()]);
        pool.set_state(PoolState::Active);
        allocator
    }

    #[test]
    fn test_add_pool_is_idempotent() {
        let allocator = registry();
        let mut config = PoolConfig::new("pool-a", "ap-test", 30000);
        config.end_port = 30010;
        config.policy = LbPolicy::Random;

        let pool = allocator.add_pool(config);
        assert_eq!(allocator.pool_names(), vec!["pool-a".to_string()]);
        // Existing LB list and quota survive
        assert_eq!(pool.lb_keys().len(), 1);
        assert_eq!(pool.quota(), Some(10));
        assert_eq!(pool.policy(), LbPolicy::Random);
    }

    #[test]
    fn test_add_pool_keeps_range() {
        let allocator = registry();
        let mut config = PoolConfig::new("pool-a", "ap-test", 40000);
        config.listener_quota = Some(20);

        let pool = allocator.add_pool(config);
        assert_eq!(pool.start_port(), 30000);
        assert_eq!(pool.end_port(), 30010);
        assert_eq!(pool.quota(), Some(20));
    }

    #[test]
    fn test_remove_pool() {
        let allocator = registry();
        assert!(allocator.remove_pool("pool-a"));
        assert!(!allocator.remove_pool("pool-a"));
        assert!(allocator.pool("pool-a").is_none());
    }

    #[test]
    fn test_allocate_unknown_pool() {
        let allocator = registry();
        let err = allocator
            .allocate(&["pool-a".to_string(), "missing".to_string()], Protocol::Tcp, false)
            .unwrap_err();
        assert_eq!(err, AllocError::PoolNotFound("missing".into()));
        assert_eq!(allocator.allocate(&[], Protocol::Tcp, false).unwrap_err(), AllocError::EmptyPools);
    }

    #[test]
    fn test_allocate_and_release() {
        let allocator = registry();
        let allocated = allocator.allocate(&["pool-a".to_string()], Protocol::Tcp, false).unwrap();
        assert_eq!(allocated.len(), 1);
        let first = &allocated[0];
        assert_eq!(first.port, ProtocolPort::new(30000, Protocol::Tcp));
        assert_eq!(first.pool_name(), "pool-a");

        allocator.release("pool-a", &first.lb, &first.port);
        let again = allocator.allocate(&["pool-a".to_string()], Protocol::Tcp, false).unwrap();
        assert_eq!(again[0].port.port, 30000);
    }

    #[test]
    fn test_mark_allocated_replay() {
        let allocator = registry();
        let lb = LbKey::new("lb-1", "ap-test");
        assert!(allocator
            .mark_allocated("pool-a", &lb, &ProtocolPort::new(30000, Protocol::TcpSsl))
            .unwrap());
        assert!(!allocator
            .mark_allocated("pool-a", &LbKey::new("lb-gone", "ap-test"), &ProtocolPort::new(30001, Protocol::Tcp))
            .unwrap());
        assert!(allocator
            .mark_allocated("nope", &lb, &ProtocolPort::new(30000, Protocol::Tcp))
            .is_err());

        // Replayed TCP_SSL blocks plain TCP on the same port
        let allocated = allocator.allocate(&["pool-a".to_string()], Protocol::Tcp, false).unwrap();
        assert_eq!(allocated[0].port.port, 30001);
    }

    #[test]
    fn test_concurrent_allocations_do_not_collide() {
        let allocator = Arc::new(PortAllocator::new());
        let mut config = PoolConfig::new("shared", "ap-test", 1000);
        config.end_port = 1999;
        config.listener_quota = Some(1000);
        let pool = allocator.add_pool(config);
        pool.ensure_lb_ids(&["lb-1".to_string()]);
        pool.set_state(PoolState::Active);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| {
                            allocator
                                .allocate(&["shared".to_string()], Protocol::Udp, false)
                                .unwrap()[0]
                                .port
                                .port
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ports: Vec<u16> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 400);
    }
}
