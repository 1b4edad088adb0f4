//! Pure port bookkeeping for bindings: spec/status diffing, status entries
//! from allocations, and the result annotation.

use std::collections::BTreeMap;
use std::str::FromStr;

use crds::annotations::PortMappingResult;
use crds::{LoadBalancerStatus, PortBindingStatus, PortEntry};
use port_allocator::{AllocError, LbKey, PortAllocation, Protocol, ProtocolPort};

/// Identity of one listener a binding needs: spec port, single listener
/// protocol and pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct PortKey {
    pub port: u16,
    pub protocol: Protocol,
    pub pool: String,
}

impl PortKey {
    pub fn of_status(binding: &PortBindingStatus) -> Result<Self, AllocError> {
        Ok(Self {
            port: binding.port,
            protocol: Protocol::from_str(&binding.protocol)?,
            pool: binding.pool.clone(),
        })
    }
}

/// Keys one spec entry expands to; TCPUDP yields a TCP and a UDP key per pool.
pub(crate) fn entry_keys(entry: &PortEntry) -> Result<Vec<PortKey>, AllocError> {
    let protocol = Protocol::from_str(&entry.protocol)?;
    Ok(entry
        .pools
        .iter()
        .flat_map(|pool| {
            protocol.expand().into_iter().map(move |p| PortKey {
                port: entry.port,
                protocol: p,
                pool: pool.clone(),
            })
        })
        .collect())
}

/// What one allocation pass has to do.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct PortPlan {
    /// Status entries that stay as they are
    pub keep: Vec<PortBindingStatus>,
    /// Status entries whose listener must be deleted and port released
    pub remove: Vec<PortBindingStatus>,
    /// Spec entries to allocate as a whole
    pub allocate: Vec<PortEntry>,
}

/// Diffs spec entries against recorded port bindings.
///
/// A spec entry with any key missing from status is allocated again as one
/// unit; whatever of it was still recorded goes to `remove` first.
pub(crate) fn plan_ports(entries: &[PortEntry], current: &[PortBindingStatus]) -> Result<PortPlan, AllocError> {
    let mut recorded: BTreeMap<PortKey, PortBindingStatus> = BTreeMap::new();
    let mut plan = PortPlan::default();
    for binding in current {
        match PortKey::of_status(binding) {
            Ok(key) if !recorded.contains_key(&key) => {
                recorded.insert(key, binding.clone());
            }
            // Duplicates and unparseable entries are dropped
            _ => plan.remove.push(binding.clone()),
        }
    }

    for entry in entries {
        let keys = entry_keys(entry)?;
        let complete = keys.iter().all(|k| recorded.contains_key(k));
        for key in keys {
            if let Some(binding) = recorded.remove(&key) {
                if complete {
                    plan.keep.push(binding);
                } else {
                    plan.remove.push(binding);
                }
            }
        }
        if !complete {
            plan.allocate.push(entry.clone());
        }
    }
    // Left over: no longer in spec
    plan.remove.extend(recorded.into_values());
    Ok(plan)
}

/// Status entry for one allocated unit of `entry`.
pub(crate) fn binding_from_allocation(entry: &PortEntry, allocation: &PortAllocation) -> PortBindingStatus {
    PortBindingStatus {
        port: entry.port,
        protocol: allocation.port.protocol.as_str().to_string(),
        cert_id: None,
        pool: allocation.pool_name().to_string(),
        lb_id: allocation.lb.lb_id.clone(),
        lb_port: allocation.port.port,
        lb_end_port: allocation.port.is_segment().then_some(allocation.port.end_port),
        listener_id: String::new(),
        region: allocation.lb.region.clone(),
    }
}

/// Allocator unit a status entry holds.
pub(crate) fn allocation_of(binding: &PortBindingStatus) -> Result<(LbKey, ProtocolPort), AllocError> {
    let protocol = Protocol::from_str(&binding.protocol)?;
    Ok((
        LbKey::new(binding.lb_id.as_str(), binding.region.as_str()),
        ProtocolPort::segment(binding.lb_port, binding.lb_end_port.unwrap_or(0), protocol),
    ))
}

/// Spec entry a status entry was allocated for.
pub(crate) fn entry_for<'a>(entries: &'a [PortEntry], binding: &PortBindingStatus) -> Option<&'a PortEntry> {
    let key = PortKey::of_status(binding).ok()?;
    entries
        .iter()
        .find(|entry| entry_keys(entry).is_ok_and(|keys| keys.contains(&key)))
}

/// Result annotation entry for one bound listener.
pub(crate) fn mapping_result(binding: &PortBindingStatus, lb: Option<&LoadBalancerStatus>) -> PortMappingResult {
    let ips = lb.map(|lb| lb.ips.clone()).unwrap_or_default();
    let hostname = lb.and_then(|lb| lb.hostname.clone());
    let host = ips.first().cloned().or_else(|| hostname.clone()).unwrap_or_default();
    let address = match binding.lb_end_port {
        Some(end) => format!("{}:{}-{}", host, binding.lb_port, end),
        None => format!("{}:{}", host, binding.lb_port),
    };
    PortMappingResult {
        port: binding.port,
        protocol: binding.protocol.clone(),
        pool: binding.pool.clone(),
        region: binding.region.clone(),
        load_balancer_id: binding.lb_id.clone(),
        load_balancer_port: binding.lb_port,
        load_balancer_end_port: binding.lb_end_port,
        listener_id: binding.listener_id.clone(),
        ips,
        hostname,
        address,
    }
}
