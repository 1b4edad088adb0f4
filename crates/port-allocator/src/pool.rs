//! Single port pool.
//!
//! A `PortPool` owns the allocation cache for one `CLBPortPool`: for every
//! load balancer in the pool, the set of canonical [`ProtocolPort`] keys
//! currently in use. All methods take the pool's own lock and never block on
//! I/O, so allocations on different pools never contend.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::protocol::{port_units, LbKey, Protocol, ProtocolPort};

/// Highest port a pool may use when no end port is configured.
pub const DEFAULT_END_PORT: u16 = 65535;

/// Order in which load balancers are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbPolicy {
    /// Least-loaded load balancer first
    #[default]
    Uniform,
    /// Load balancers in configured order
    InOrder,
    /// Random order on every allocation
    Random,
}

impl LbPolicy {
    /// Parses the CRD representation, falling back to `Uniform`.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("InOrder") => LbPolicy::InOrder,
            Some("Random") => LbPolicy::Random,
            _ => LbPolicy::Uniform,
        }
    }
}

/// Lifecycle state of a pool as seen by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolState {
    /// Not synced yet
    #[default]
    Pending,
    /// Ready for allocation
    Active,
    /// Load balancers are being added; allocation continues
    Scaling,
    /// Being removed
    Deleting,
}

impl PoolState {
    /// Whether new ports may be taken from a pool in this state.
    pub fn is_allocatable(self) -> bool {
        matches!(self, PoolState::Active | PoolState::Scaling)
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolState::Pending => "Pending",
            PoolState::Active => "Active",
            PoolState::Scaling => "Scaling",
            PoolState::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

/// Static configuration of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool name (the `CLBPortPool` name)
    pub name: String,
    /// Region of every load balancer in the pool
    pub region: String,
    /// First usable port
    pub start_port: u16,
    /// Last usable port
    pub end_port: u16,
    /// 0 or 1 for single ports, otherwise the segment size
    pub segment_length: u16,
    /// Listeners allowed per load balancer, `None` until resolved
    pub listener_quota: Option<usize>,
    /// Load balancer selection policy
    pub policy: LbPolicy,
}

impl PoolConfig {
    /// Config for a single-port pool spanning `start_port..=65535`.
    pub fn new(name: impl Into<String>, region: impl Into<String>, start_port: u16) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            start_port,
            end_port: DEFAULT_END_PORT,
            segment_length: 0,
            listener_quota: None,
            policy: LbPolicy::Uniform,
        }
    }
}

#[derive(Debug, Default)]
struct PoolCache {
    quota: Option<usize>,
    policy: LbPolicy,
    state: PoolState,
    lbs: Vec<LbKey>,
    allocated: HashMap<LbKey, HashSet<ProtocolPort>>,
    blacklist: HashSet<LbKey>,
}

impl PoolCache {
    fn ordered_lbs(&self) -> Vec<LbKey> {
        let mut lbs: Vec<LbKey> = self
            .lbs
            .iter()
            .filter(|lb| !self.blacklist.contains(*lb))
            .cloned()
            .collect();
        match self.policy {
            LbPolicy::InOrder => {}
            LbPolicy::Uniform => {
                lbs.sort_by_key(|lb| self.allocated.get(lb).map_or(0, HashSet::len));
            }
            LbPolicy::Random => lbs.shuffle(&mut rand::rng()),
        }
        lbs
    }
}

/// Allocation cache and algorithm for one port pool.
#[derive(Debug)]
pub struct PortPool {
    name: String,
    region: String,
    start_port: u16,
    end_port: u16,
    segment_length: u16,
    cache: Mutex<PoolCache>,
}

impl PortPool {
    /// Creates an empty pool with no load balancers.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            name: config.name,
            region: config.region,
            start_port: config.start_port,
            end_port: config.end_port,
            segment_length: config.segment_length,
            cache: Mutex::new(PoolCache {
                quota: config.listener_quota,
                policy: config.policy,
                ..PoolCache::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool region.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// First usable port.
    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    /// Last usable port.
    pub fn end_port(&self) -> u16 {
        self.end_port
    }

    /// Configured segment length (0 or 1 means single ports).
    pub fn segment_length(&self) -> u16 {
        self.segment_length
    }

    /// Whether the immutable part of `config` matches this pool.
    pub fn matches_range(&self, config: &PoolConfig) -> bool {
        self.region == config.region
            && self.start_port == config.start_port
            && self.end_port == config.end_port
            && self.segment_length.max(1) == config.segment_length.max(1)
    }

    /// Resolved listener quota per load balancer.
    pub fn quota(&self) -> Option<usize> {
        self.lock().quota
    }

    /// Sets the listener quota per load balancer.
    pub fn set_quota(&self, quota: Option<usize>) {
        self.lock().quota = quota;
    }

    /// Current selection policy.
    pub fn policy(&self) -> LbPolicy {
        self.lock().policy
    }

    /// Changes the selection policy.
    pub fn set_policy(&self, policy: LbPolicy) {
        self.lock().policy = policy;
    }

    /// Current pool state.
    pub fn state(&self) -> PoolState {
        self.lock().state
    }

    /// Changes the pool state.
    pub fn set_state(&self, state: PoolState) {
        self.lock().state = state;
    }

    /// Load balancers in configured order.
    pub fn lb_keys(&self) -> Vec<LbKey> {
        self.lock().lbs.clone()
    }

    /// Reserves `ports` together on a single load balancer.
    ///
    /// Load balancers are tried in policy order, skipping blacklisted ones.
    /// A load balancer whose allocated count plus `ports.len()` would exceed
    /// `quota` is full. The returned flag is `true` only when every eligible
    /// load balancer is full (or there are none), meaning retrying with
    /// another port cannot help.
    pub fn allocate_port(self: &Arc<Self>, quota: usize, ports: &[ProtocolPort]) -> (Vec<PortAllocation>, bool) {
        if ports.is_empty() {
            return (Vec::new(), false);
        }

        let mut cache = self.lock();
        let mut quota_exceeded = true;
        for lb in cache.ordered_lbs() {
            let Some(allocated) = cache.allocated.get_mut(&lb) else {
                continue;
            };
            if allocated.len() + ports.len() > quota {
                continue;
            }
            quota_exceeded = false;
            if ports.iter().any(|p| allocated.contains(&p.key())) {
                continue;
            }

            for port in ports {
                allocated.insert(port.key());
            }
            debug!(
                "Pool {} allocated {} on {} ({}/{} listeners)",
                self.name,
                ports.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
                lb,
                allocated.len(),
                quota
            );
            let allocations = ports
                .iter()
                .map(|port| PortAllocation {
                    port: *port,
                    lb: lb.clone(),
                    pool: Arc::clone(self),
                })
                .collect();
            return (allocations, false);
        }

        (Vec::new(), quota_exceeded)
    }

    /// Reserves the first free port (or segment) for `protocol` in `start..=end`.
    ///
    /// TCPUDP reserves both protocols at the same number on the same load
    /// balancer. Whether a load balancer is full does not depend on the port
    /// number, so the scan stops at the first candidate reporting
    /// `quota_exceeded`. An empty result with `false` means the range is
    /// exhausted.
    pub fn allocate_port_from_range(
        self: &Arc<Self>,
        start: u16,
        end: u16,
        quota: usize,
        segment_length: u16,
        protocol: Protocol,
    ) -> (Vec<PortAllocation>, bool) {
        for (port, end_port) in port_units(start, end, segment_length) {
            let units = ProtocolPort::expand(port, end_port, protocol);
            let (allocated, quota_exceeded) = self.allocate_port(quota, &units);
            if !allocated.is_empty() {
                return (allocated, false);
            }
            if quota_exceeded {
                return (Vec::new(), true);
            }
        }
        (Vec::new(), false)
    }

    /// Whether at least one more port can be taken from this pool.
    pub fn can_allocate(&self) -> bool {
        let cache = self.lock();
        let quota = cache.quota.unwrap_or(usize::MAX);
        cache
            .lbs
            .iter()
            .filter(|lb| !cache.blacklist.contains(*lb))
            .filter_map(|lb| cache.allocated.get(lb))
            .any(|allocated| {
                allocated.len() < quota
                    && port_units(self.start_port, self.end_port, self.segment_length).any(|(port, end_port)| {
                        [Protocol::Tcp, Protocol::Udp]
                            .into_iter()
                            .any(|p| !allocated.contains(&ProtocolPort::segment(port, end_port, p)))
                    })
            })
    }

    /// Frees one unit. Returns `false` if it was not allocated.
    pub fn release_port(&self, lb: &LbKey, port: &ProtocolPort) -> bool {
        let released = self
            .lock()
            .allocated
            .get_mut(lb)
            .is_some_and(|allocated| allocated.remove(&port.key()));
        if released {
            debug!("Pool {} released {} on {}", self.name, port, lb);
        }
        released
    }

    /// Records a unit that was allocated before, without policy or quota
    /// checks. Returns `false` if `lb` is not part of the pool.
    pub fn mark_allocated(&self, lb: &LbKey, port: &ProtocolPort) -> bool {
        match self.lock().allocated.get_mut(lb) {
            Some(allocated) => {
                allocated.insert(port.key());
                true
            }
            None => false,
        }
    }

    /// Drops a load balancer and everything allocated on it.
    pub fn remove_lb(&self, lb: &LbKey) {
        let mut cache = self.lock();
        cache.lbs.retain(|k| k != lb);
        cache.blacklist.remove(lb);
        if let Some(allocated) = cache.allocated.remove(lb) {
            info!(
                "Removed load balancer {} from pool {} ({} allocated ports dropped)",
                lb,
                self.name,
                allocated.len()
            );
        }
    }

    /// Makes the pool's load balancer set equal to `lb_ids`.
    ///
    /// Allocations on load balancers that stay are preserved; new ones start
    /// empty. Calling it again with the same list changes nothing.
    pub fn ensure_lb_ids(&self, lb_ids: &[String]) {
        let mut desired: Vec<LbKey> = Vec::with_capacity(lb_ids.len());
        for id in lb_ids {
            let key = LbKey::new(id.as_str(), self.region.as_str());
            if !desired.contains(&key) {
                desired.push(key);
            }
        }

        let mut cache = self.lock();
        let stale: Vec<LbKey> = cache
            .allocated
            .keys()
            .filter(|lb| !desired.contains(*lb))
            .cloned()
            .collect();
        for lb in stale {
            if let Some(allocated) = cache.allocated.remove(&lb) {
                info!(
                    "Load balancer {} left pool {} ({} allocated ports dropped)",
                    lb,
                    self.name,
                    allocated.len()
                );
            }
        }
        for lb in &desired {
            if !cache.allocated.contains_key(lb) {
                info!("Load balancer {} joined pool {}", lb, self.name);
                cache.allocated.insert(lb.clone(), HashSet::new());
            }
        }
        cache.blacklist.retain(|lb| desired.contains(lb));
        cache.lbs = desired;
    }

    /// Excludes a load balancer from allocation until the blacklist is cleared.
    pub fn blacklist_lb(&self, lb: &LbKey) {
        if self.lock().blacklist.insert(lb.clone()) {
            info!("Load balancer {} blacklisted in pool {}", lb, self.name);
        }
    }

    /// Whether a load balancer is currently excluded.
    pub fn is_blacklisted(&self, lb: &LbKey) -> bool {
        self.lock().blacklist.contains(lb)
    }

    /// Makes every load balancer eligible again.
    pub fn clear_blacklist(&self) {
        self.lock().blacklist.clear();
    }

    /// Canonical keys allocated on `lb`, sorted.
    pub fn allocated_ports(&self, lb: &LbKey) -> Vec<ProtocolPort> {
        let mut ports: Vec<ProtocolPort> = self
            .lock()
            .allocated
            .get(lb)
            .map(|allocated| allocated.iter().copied().collect())
            .unwrap_or_default();
        ports.sort();
        ports
    }

    /// Number of listeners allocated on `lb`.
    pub fn allocated_count(&self, lb: &LbKey) -> usize {
        self.lock().allocated.get(lb).map_or(0, HashSet::len)
    }

    /// Number of listeners allocated on each load balancer, in pool order.
    pub fn allocated_counts(&self) -> Vec<(LbKey, usize)> {
        let cache = self.lock();
        cache
            .lbs
            .iter()
            .map(|lb| (lb.clone(), cache.allocated.get(lb).map_or(0, HashSet::len)))
            .collect()
    }
}

/// One reserved unit; releasing it frees the port in its owning pool.
#[derive(Debug, Clone)]
pub struct PortAllocation {
    /// The unit, with its original protocol
    pub port: ProtocolPort,
    /// Load balancer the unit lives on
    pub lb: LbKey,
    pool: Arc<PortPool>,
}

impl PortAllocation {
    /// Name of the owning pool.
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    /// Owning pool.
    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Frees the unit.
    pub fn release(&self) {
        self.pool.release_port(&self.lb, &self.port);
    }
}

/// Every unit reserved for one request.
#[derive(Debug, Clone, Default)]
pub struct PortAllocations(Vec<PortAllocation>);

impl PortAllocations {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds units.
    pub fn extend(&mut self, allocations: impl IntoIterator<Item = PortAllocation>) {
        self.0.extend(allocations);
    }

    /// Frees every unit.
    pub fn release(&self) {
        for allocation in &self.0 {
            allocation.release();
        }
    }

    /// Consumes the set.
    pub fn into_inner(self) -> Vec<PortAllocation> {
        self.0
    }
}

impl Deref for PortAllocations {
    type Target = [PortAllocation];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for PortAllocations {
    type Item = PortAllocation;
    type IntoIter = std::vec::IntoIter<PortAllocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(start: u16, end: u16, segment_length: u16, lbs: &[&str], quota: usize) -> Arc<PortPool> {
        let mut config = PoolConfig::new("test-pool", "ap-test", start);
        config.end_port = end;
        config.segment_length = segment_length;
        config.listener_quota = Some(quota);
        config.policy = LbPolicy::InOrder;
        let pool = Arc::new(PortPool::new(config));
        pool.ensure_lb_ids(&lbs.iter().map(|s| (*s).to_string()).collect::<Vec<_>>());
        pool.set_state(PoolState::Active);
        pool
    }

    fn lb(id: &str) -> LbKey {
        LbKey::new(id, "ap-test")
    }

    #[test]
    fn test_can_allocate_empty_lb_set() {
        let pool = pool_with(500, 510, 0, &[], 50);
        assert!(!pool.can_allocate());
    }

    #[test]
    fn test_can_allocate_until_range_exhausted() {
        let pool = pool_with(500, 502, 0, &["lb-1"], 50);
        assert!(pool.can_allocate());

        for port in 500..=502 {
            for protocol in [Protocol::Tcp, Protocol::Udp] {
                let (allocated, _) = pool.allocate_port(50, &[ProtocolPort::new(port, protocol)]);
                assert_eq!(allocated.len(), 1);
            }
        }
        assert!(!pool.can_allocate());
    }

    #[test]
    fn test_tcpudp_requires_both_protocols_free() {
        let pool = pool_with(500, 502, 0, &["lb-1"], 50);
        for port in [500, 501] {
            let (allocated, _) = pool.allocate_port(50, &[ProtocolPort::new(port, Protocol::Tcp)]);
            assert_eq!(allocated.len(), 1);
        }

        let (allocated, quota_exceeded) = pool.allocate_port_from_range(500, 502, 50, 0, Protocol::TcpUdp);
        assert!(!quota_exceeded);
        assert_eq!(allocated.len(), 2);
        assert!(allocated.iter().all(|a| a.port.port == 502));

        // UDP on 500 is still free on its own
        let (allocated, _) = pool.allocate_port(50, &[ProtocolPort::new(500, Protocol::Udp)]);
        assert_eq!(allocated.len(), 1);
    }

    #[test]
    fn test_paired_request_is_atomic() {
        let pool = pool_with(500, 500, 0, &["lb-1"], 50);
        pool.allocate_port(50, &[ProtocolPort::new(500, Protocol::Udp)]);

        let (allocated, _) = pool.allocate_port(50, &ProtocolPort::expand(500, 0, Protocol::TcpUdp));
        assert!(allocated.is_empty());
        // The TCP half must not have been recorded
        assert_eq!(pool.allocated_ports(&lb("lb-1")), vec![ProtocolPort::new(500, Protocol::Udp)]);
    }

    #[test]
    fn test_segment_allocation_takes_whole_segment() {
        let pool = pool_with(500, 509, 5, &["lb-1"], 50);

        let (first, _) = pool.allocate_port_from_range(500, 509, 50, 5, Protocol::Tcp);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].port, ProtocolPort::segment(500, 504, Protocol::Tcp));

        let (second, _) = pool.allocate_port_from_range(500, 509, 50, 5, Protocol::Tcp);
        assert_eq!(second[0].port, ProtocolPort::segment(505, 509, Protocol::Tcp));

        let (third, quota_exceeded) = pool.allocate_port_from_range(500, 509, 50, 5, Protocol::Tcp);
        assert!(third.is_empty());
        assert!(!quota_exceeded);
    }

    #[test]
    fn test_allocate_release_allocate_returns_same_port() {
        let pool = pool_with(500, 510, 0, &["lb-1"], 50);
        let (first, _) = pool.allocate_port_from_range(500, 510, 50, 0, Protocol::Tcp);
        assert_eq!(first[0].port.port, 500);
        first[0].release();

        let (second, _) = pool.allocate_port_from_range(500, 510, 50, 0, Protocol::Tcp);
        assert_eq!(second[0].port.port, 500);
        assert_eq!(second[0].lb, first[0].lb);
    }

    #[test]
    fn test_ensure_lb_ids_is_idempotent() {
        let pool = pool_with(500, 510, 0, &["lb-1", "lb-2"], 50);
        pool.allocate_port(50, &[ProtocolPort::new(500, Protocol::Tcp)]);

        pool.ensure_lb_ids(&["lb-1".to_string(), "lb-2".to_string()]);
        pool.ensure_lb_ids(&["lb-1".to_string(), "lb-2".to_string()]);
        assert_eq!(pool.lb_keys(), vec![lb("lb-1"), lb("lb-2")]);
        assert_eq!(pool.allocated_ports(&lb("lb-1")), vec![ProtocolPort::new(500, Protocol::Tcp)]);

        // Dropping lb-2 keeps lb-1's allocations
        pool.ensure_lb_ids(&["lb-1".to_string()]);
        assert_eq!(pool.lb_keys(), vec![lb("lb-1")]);
        assert_eq!(pool.allocated_ports(&lb("lb-1")).len(), 1);
        assert!(pool.allocated_ports(&lb("lb-2")).is_empty());
    }

    #[test]
    fn test_quota_exceeded_only_when_every_lb_full() {
        let pool = pool_with(500, 510, 0, &["lb-1", "lb-2"], 1);

        let (a, _) = pool.allocate_port(1, &[ProtocolPort::new(500, Protocol::Tcp)]);
        assert_eq!(a[0].lb, lb("lb-1"));
        let (b, exceeded) = pool.allocate_port(1, &[ProtocolPort::new(500, Protocol::Tcp)]);
        assert!(!exceeded);
        assert_eq!(b[0].lb, lb("lb-2"));

        let (c, exceeded) = pool.allocate_port_from_range(500, 510, 1, 0, Protocol::Tcp);
        assert!(c.is_empty());
        assert!(exceeded);
    }

    #[test]
    fn test_no_free_port_is_not_quota_exceeded() {
        let pool = pool_with(500, 500, 0, &["lb-1"], 50);
        pool.allocate_port(50, &[ProtocolPort::new(500, Protocol::Tcp)]);

        let (allocated, exceeded) = pool.allocate_port_from_range(500, 500, 50, 0, Protocol::Tcp);
        assert!(allocated.is_empty());
        assert!(!exceeded);
    }

    #[test]
    fn test_tcp_ssl_collides_with_tcp() {
        let pool = pool_with(443, 443, 0, &["lb-1"], 50);
        let (ssl, _) = pool.allocate_port(50, &[ProtocolPort::new(443, Protocol::TcpSsl)]);
        assert_eq!(ssl[0].port.protocol, Protocol::TcpSsl);

        let (tcp, _) = pool.allocate_port(50, &[ProtocolPort::new(443, Protocol::Tcp)]);
        assert!(tcp.is_empty());
    }

    #[test]
    fn test_uniform_policy_prefers_least_loaded() {
        let pool = pool_with(500, 510, 0, &["lb-1", "lb-2"], 50);
        pool.set_policy(LbPolicy::Uniform);
        pool.mark_allocated(&lb("lb-1"), &ProtocolPort::new(500, Protocol::Tcp));

        let (allocated, _) = pool.allocate_port(50, &[ProtocolPort::new(501, Protocol::Tcp)]);
        assert_eq!(allocated[0].lb, lb("lb-2"));
    }

    #[test]
    fn test_random_policy_still_allocates() {
        let pool = pool_with(500, 510, 0, &["lb-1", "lb-2", "lb-3"], 50);
        pool.set_policy(LbPolicy::Random);
        for _ in 0..9 {
            let (allocated, _) = pool.allocate_port_from_range(500, 510, 50, 0, Protocol::Udp);
            assert_eq!(allocated.len(), 1);
        }
        let total: usize = pool.allocated_counts().iter().map(|(_, n)| n).sum();
        assert_eq!(total, 9);
    }

    #[test]
    fn test_blacklisted_lb_is_skipped() {
        let pool = pool_with(500, 510, 0, &["lb-1", "lb-2"], 50);
        pool.blacklist_lb(&lb("lb-1"));

        let (allocated, _) = pool.allocate_port(50, &[ProtocolPort::new(500, Protocol::Tcp)]);
        assert_eq!(allocated[0].lb, lb("lb-2"));

        pool.clear_blacklist();
        assert!(!pool.is_blacklisted(&lb("lb-1")));
    }

    #[test]
    fn test_mark_allocated_unknown_lb() {
        let pool = pool_with(500, 510, 0, &["lb-1"], 50);
        assert!(!pool.mark_allocated(&lb("lb-9"), &ProtocolPort::new(500, Protocol::Tcp)));
        assert!(pool.mark_allocated(&lb("lb-1"), &ProtocolPort::new(500, Protocol::Quic)));
        assert_eq!(pool.allocated_ports(&lb("lb-1")), vec![ProtocolPort::new(500, Protocol::Udp)]);
    }

    #[test]
    fn test_remove_lb_drops_allocations() {
        let pool = pool_with(500, 510, 0, &["lb-1", "lb-2"], 50);
        pool.mark_allocated(&lb("lb-2"), &ProtocolPort::new(500, Protocol::Tcp));
        pool.remove_lb(&lb("lb-2"));
        assert_eq!(pool.lb_keys(), vec![lb("lb-1")]);
        assert_eq!(pool.allocated_counts(), vec![(lb("lb-1"), 0)]);
    }
}
