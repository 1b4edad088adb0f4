//! ClbApi trait for mocking
//!
//! Raw provider operations, one method per API action. The concrete
//! [`HttpClbApi`](crate::HttpClbApi) implements this trait; tests use
//! `MockClbApi` behind the `test-util` feature.

use crate::error::ClbError;
use crate::models::*;

/// Raw CLB provider operations.
///
/// Mutating actions are asynchronous on the provider side and return a task
/// ID to poll with [`describe_task_status`](ClbApi::describe_task_status).
#[async_trait::async_trait]
pub trait ClbApi: Send + Sync + std::fmt::Debug {
    /// Creates listeners on one load balancer; returns listener IDs in
    /// request order and the task ID.
    async fn create_listeners(
        &self,
        region: &str,
        lb_id: &str,
        listeners: &[CreateListenerRequest],
    ) -> Result<(Vec<String>, String), ClbError>;

    /// Deletes listeners from one load balancer.
    async fn delete_listeners(&self, region: &str, lb_id: &str, listener_ids: &[String]) -> Result<String, ClbError>;

    /// Lists listeners, optionally filtered by port and protocol.
    async fn describe_listeners(
        &self,
        region: &str,
        lb_id: &str,
        port: Option<u16>,
        protocol: Option<&str>,
    ) -> Result<Vec<Listener>, ClbError>;

    /// Registers backends on listeners of one load balancer.
    async fn register_targets(&self, region: &str, lb_id: &str, targets: &[ListenerTarget]) -> Result<String, ClbError>;

    /// Deregisters backends from listeners of one load balancer.
    async fn deregister_targets(&self, region: &str, lb_id: &str, targets: &[ListenerTarget]) -> Result<String, ClbError>;

    /// Lists backends of the given listeners.
    async fn describe_targets(
        &self,
        region: &str,
        lb_id: &str,
        listener_ids: &[String],
    ) -> Result<Vec<ListenerTargets>, ClbError>;

    /// Describes load balancers; missing IDs are absent from the result.
    async fn describe_load_balancers(&self, region: &str, lb_ids: &[String]) -> Result<Vec<LoadBalancer>, ClbError>;

    /// Creates a load balancer; returns its ID and the task ID.
    async fn create_load_balancer(
        &self,
        region: &str,
        request: &CreateLoadBalancerRequest,
    ) -> Result<(String, String), ClbError>;

    /// Deletes load balancers.
    async fn delete_load_balancers(&self, region: &str, lb_ids: &[String]) -> Result<String, ClbError>;

    /// Account quotas for a region.
    async fn describe_quota(&self, region: &str) -> Result<Vec<Quota>, ClbError>;

    /// Status of an asynchronous task.
    async fn describe_task_status(&self, region: &str, task_id: &str) -> Result<(TaskStatus, Option<String>), ClbError>;
}
