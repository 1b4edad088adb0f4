//! Mock ClbApi for unit testing
//!
//! In-memory provider: load balancers, listeners and targets live in maps,
//! asynchronous tasks finish after a configurable number of polls, and faults
//! can be injected to exercise retry paths.

use crate::clb_trait::ClbApi;
use crate::error::ClbError;
use crate::models::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// API action name
    pub action: &'static str,
    /// Load balancer the call targeted, empty for regional calls
    pub lb_id: String,
    /// Number of items in the request
    pub items: usize,
}

#[derive(Debug, Default)]
struct MockState {
    load_balancers: HashMap<String, LoadBalancer>,
    listeners: HashMap<String, Vec<Listener>>,
    targets: HashMap<String, Vec<Target>>,
    listener_quota: u64,
    rate_limited_calls: usize,
    task_polls: usize,
    tasks: HashMap<String, usize>,
    failing_tasks: bool,
    calls: Vec<MockCall>,
    next_id: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn begin(&mut self, action: &'static str, lb_id: &str, items: usize) -> Result<(), ClbError> {
        self.calls.push(MockCall {
            action,
            lb_id: lb_id.to_string(),
            items,
        });
        if self.rate_limited_calls > 0 {
            self.rate_limited_calls -= 1;
            return Err(ClbError::from_code("RequestLimitExceeded", action));
        }
        Ok(())
    }

    fn require_lb(&self, lb_id: &str) -> Result<(), ClbError> {
        if self.load_balancers.contains_key(lb_id) {
            Ok(())
        } else {
            Err(ClbError::from_code("InvalidParameter.LBIdNotFound", lb_id))
        }
    }

    fn task(&mut self) -> String {
        let id = self.next_id("task");
        self.tasks.insert(id.clone(), self.task_polls);
        id
    }
}

/// Mock ClbApi for testing
///
/// Clones share state, so a test can keep a handle while the client under
/// test owns another.
#[derive(Debug, Clone)]
pub struct MockClbApi {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockClbApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClbApi {
    /// Create a new mock with a listener quota of 50
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                listener_quota: 50,
                ..MockState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a load balancer (for test setup)
    pub fn add_load_balancer(&self, lb_id: &str, vips: &[&str]) {
        let mut state = self.lock();
        state.load_balancers.insert(
            lb_id.to_string(),
            LoadBalancer {
                load_balancer_id: lb_id.to_string(),
                load_balancer_name: lb_id.to_string(),
                vips: vips.iter().map(|v| (*v).to_string()).collect(),
                domain: None,
            },
        );
        state.listeners.entry(lb_id.to_string()).or_default();
    }

    /// Remove a load balancer out of band
    pub fn remove_load_balancer(&self, lb_id: &str) {
        let mut state = self.lock();
        state.load_balancers.remove(lb_id);
        state.listeners.remove(lb_id);
    }

    /// Whether a load balancer exists
    pub fn has_load_balancer(&self, lb_id: &str) -> bool {
        self.lock().load_balancers.contains_key(lb_id)
    }

    /// Listener slots per load balancer
    pub fn set_listener_quota(&self, quota: u64) {
        self.lock().listener_quota = quota;
    }

    /// Fail the next `n` calls with `RequestLimitExceeded`
    pub fn rate_limit_next(&self, n: usize) {
        self.lock().rate_limited_calls = n;
    }

    /// Report new tasks as running for `n` polls before they finish
    pub fn set_task_polls(&self, n: usize) {
        self.lock().task_polls = n;
    }

    /// Make every finished task report failure
    pub fn fail_tasks(&self, fail: bool) {
        self.lock().failing_tasks = fail;
    }

    /// Listeners of a load balancer
    pub fn listeners(&self, lb_id: &str) -> Vec<Listener> {
        self.lock().listeners.get(lb_id).cloned().unwrap_or_default()
    }

    /// Targets of a listener
    pub fn targets(&self, listener_id: &str) -> Vec<Target> {
        self.lock().targets.get(listener_id).cloned().unwrap_or_default()
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Calls of one action
    pub fn calls_of(&self, action: &str) -> Vec<MockCall> {
        self.lock().calls.iter().filter(|c| c.action == action).cloned().collect()
    }
}

#[async_trait::async_trait]
impl ClbApi for MockClbApi {
    async fn create_listeners(
        &self,
        _region: &str,
        lb_id: &str,
        listeners: &[CreateListenerRequest],
    ) -> Result<(Vec<String>, String), ClbError> {
        let mut state = self.lock();
        state.begin("CreateListener", lb_id, listeners.len())?;
        state.require_lb(lb_id)?;

        let existing = state.listeners.get(lb_id).map_or(0, Vec::len);
        if (existing + listeners.len()) as u64 > state.listener_quota {
            return Err(ClbError::from_code("LimitExceeded.ListenerQuota", lb_id));
        }
        for request in listeners {
            let clash = state.listeners.get(lb_id).is_some_and(|ls| {
                ls.iter()
                    .any(|l| l.port == request.port && l.protocol == request.protocol)
            });
            if clash {
                return Err(ClbError::Api {
                    code: "InvalidParameter.PortConflict".to_string(),
                    message: format!("{} {}", request.protocol, request.port),
                });
            }
        }

        let mut ids = Vec::with_capacity(listeners.len());
        for request in listeners {
            let id = state.next_id("lbl");
            state.listeners.entry(lb_id.to_string()).or_default().push(Listener {
                listener_id: id.clone(),
                protocol: request.protocol.clone(),
                port: request.port,
                end_port: request.end_port,
                certificate_id: request.certificate_id.clone(),
            });
            ids.push(id);
        }
        Ok((ids, state.task()))
    }

    async fn delete_listeners(&self, _region: &str, lb_id: &str, listener_ids: &[String]) -> Result<String, ClbError> {
        let mut state = self.lock();
        state.begin("DeleteLoadBalancerListeners", lb_id, listener_ids.len())?;
        state.require_lb(lb_id)?;
        if let Some(listeners) = state.listeners.get_mut(lb_id) {
            listeners.retain(|l| !listener_ids.contains(&l.listener_id));
        }
        for id in listener_ids {
            state.targets.remove(id);
        }
        Ok(state.task())
    }

    async fn describe_listeners(
        &self,
        _region: &str,
        lb_id: &str,
        port: Option<u16>,
        protocol: Option<&str>,
    ) -> Result<Vec<Listener>, ClbError> {
        let mut state = self.lock();
        state.begin("DescribeListeners", lb_id, 1)?;
        state.require_lb(lb_id)?;
        Ok(state
            .listeners
            .get(lb_id)
            .map(|ls| {
                ls.iter()
                    .filter(|l| port.is_none_or(|p| l.port == p))
                    .filter(|l| protocol.is_none_or(|p| l.protocol == p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn register_targets(&self, _region: &str, lb_id: &str, targets: &[ListenerTarget]) -> Result<String, ClbError> {
        let mut state = self.lock();
        state.begin("BatchRegisterTargets", lb_id, targets.len())?;
        state.require_lb(lb_id)?;
        for t in targets {
            let entry = state.targets.entry(t.listener_id.clone()).or_default();
            let target = Target::new(t.ip.clone(), t.port);
            if !entry.contains(&target) {
                entry.push(target);
            }
        }
        Ok(state.task())
    }

    async fn deregister_targets(&self, _region: &str, lb_id: &str, targets: &[ListenerTarget]) -> Result<String, ClbError> {
        let mut state = self.lock();
        state.begin("BatchDeregisterTargets", lb_id, targets.len())?;
        state.require_lb(lb_id)?;
        for t in targets {
            if let Some(entry) = state.targets.get_mut(&t.listener_id) {
                entry.retain(|x| !(x.ip == t.ip && x.port == t.port));
            }
        }
        Ok(state.task())
    }

    async fn describe_targets(
        &self,
        _region: &str,
        lb_id: &str,
        listener_ids: &[String],
    ) -> Result<Vec<ListenerTargets>, ClbError> {
        let mut state = self.lock();
        state.begin("DescribeTargets", lb_id, listener_ids.len())?;
        state.require_lb(lb_id)?;
        Ok(listener_ids
            .iter()
            .map(|id| ListenerTargets {
                listener_id: id.clone(),
                targets: state.targets.get(id).cloned().unwrap_or_default(),
            })
            .collect())
    }

    async fn describe_load_balancers(&self, _region: &str, lb_ids: &[String]) -> Result<Vec<LoadBalancer>, ClbError> {
        let mut state = self.lock();
        state.begin("DescribeLoadBalancers", "", lb_ids.len())?;
        Ok(lb_ids
            .iter()
            .filter_map(|id| state.load_balancers.get(id).cloned())
            .collect())
    }

    async fn create_load_balancer(
        &self,
        _region: &str,
        request: &CreateLoadBalancerRequest,
    ) -> Result<(String, String), ClbError> {
        let mut state = self.lock();
        state.begin("CreateLoadBalancer", "", 1)?;
        let id = state.next_id("lb");
        let vip = format!("10.0.0.{}", state.next_id % 250 + 1);
        state.load_balancers.insert(
            id.clone(),
            LoadBalancer {
                load_balancer_id: id.clone(),
                load_balancer_name: request.load_balancer_name.clone(),
                vips: vec![vip],
                domain: None,
            },
        );
        state.listeners.insert(id.clone(), Vec::new());
        Ok((id, state.task()))
    }

    async fn delete_load_balancers(&self, _region: &str, lb_ids: &[String]) -> Result<String, ClbError> {
        let mut state = self.lock();
        state.begin("DeleteLoadBalancer", "", lb_ids.len())?;
        for id in lb_ids {
            state.load_balancers.remove(id);
            state.listeners.remove(id);
        }
        Ok(state.task())
    }

    async fn describe_quota(&self, _region: &str) -> Result<Vec<Quota>, ClbError> {
        let mut state = self.lock();
        state.begin("DescribeQuota", "", 1)?;
        Ok(vec![Quota {
            quota_id: LISTENER_QUOTA_ID.to_string(),
            quota_current: None,
            quota_limit: state.listener_quota,
        }])
    }

    async fn describe_task_status(&self, _region: &str, task_id: &str) -> Result<(TaskStatus, Option<String>), ClbError> {
        let mut state = self.lock();
        state.begin("DescribeTaskStatus", "", 1)?;
        let failing = state.failing_tasks;
        match state.tasks.get_mut(task_id) {
            Some(0) if failing => Ok((TaskStatus::Failed, Some("injected failure".to_string()))),
            Some(0) => Ok((TaskStatus::Succeeded, None)),
            Some(remaining) => {
                *remaining -= 1;
                Ok((TaskStatus::Running, None))
            }
            None => Err(ClbError::from_code("InvalidParameter.TaskNotFound", task_id)),
        }
    }
}
