//! High-level CLB client used by reconcilers.
//!
//! Wraps a [`ClbApi`] with batching, rate-limit retry, task polling and
//! per-load-balancer serialization of mutating calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::{BatchConfig, Batcher, Dispatch};
use crate::clb_trait::ClbApi;
use crate::error::ClbError;
use crate::lock::LbLocks;
use crate::models::*;
use crate::retry::{RetryPolicy, retry_rate_limited, wait_task};

/// Client tuning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClbClientConfig {
    /// Batch sizing shared by all batched operations
    pub batch: BatchConfig,
    /// Retry and polling budget
    pub retry: RetryPolicy,
}

#[derive(Debug)]
struct Shared {
    api: Arc<dyn ClbApi>,
    locks: LbLocks,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Shared {
    /// Runs one mutating call under the LB lock and waits for its task.
    async fn mutate<T, F>(&self, action: &str, region: &str, lb_id: &str, call: F) -> Result<T, ClbError>
    where
        F: Fn() -> futures::future::BoxFuture<'static, Result<(T, String), ClbError>>,
    {
        let _guard = self.locks.lock(region, lb_id).await;
        let (value, task_id) = retry_rate_limited(&self.retry, &self.cancel, action, &call).await?;
        wait_task(self.api.as_ref(), &self.retry, &self.cancel, region, &task_id).await?;
        Ok(value)
    }
}

fn fan_out<R>(result: Result<Vec<R>, ClbError>, count: usize) -> Vec<Result<R, ClbError>> {
    match result {
        Ok(values) => values.into_iter().map(Ok).collect(),
        Err(e) => (0..count).map(|_| Err(e.replicate())).collect(),
    }
}

fn create_listener_dispatch(shared: &Arc<Shared>) -> Dispatch<CreateListenerRequest, String> {
    let shared = Arc::clone(shared);
    Arc::new(move |region: String, lb_id: String, requests: Vec<CreateListenerRequest>| {
        let shared = Arc::clone(&shared);
        async move {
            let count = requests.len();
            let requests = Arc::new(requests);
            let result = shared
                .mutate("CreateListener", &region, &lb_id, || {
                    let api = Arc::clone(&shared.api);
                    let (region, lb_id, requests) = (region.clone(), lb_id.clone(), Arc::clone(&requests));
                    async move { api.create_listeners(&region, &lb_id, &requests).await }.boxed()
                })
                .await;
            if let Ok(ids) = &result {
                info!("Created {} listener(s) on {}/{}", ids.len(), region, lb_id);
            }
            fan_out(result, count)
        }
        .boxed()
    })
}

fn delete_listener_dispatch(shared: &Arc<Shared>) -> Dispatch<String, ()> {
    let shared = Arc::clone(shared);
    Arc::new(move |region: String, lb_id: String, listener_ids: Vec<String>| {
        let shared = Arc::clone(&shared);
        async move {
            let count = listener_ids.len();
            let mut unique = listener_ids;
            unique.sort();
            unique.dedup();
            let unique = Arc::new(unique);
            let result = shared
                .mutate("DeleteLoadBalancerListeners", &region, &lb_id, || {
                    let api = Arc::clone(&shared.api);
                    let (region, lb_id, ids) = (region.clone(), lb_id.clone(), Arc::clone(&unique));
                    async move { api.delete_listeners(&region, &lb_id, &ids).await.map(|task| ((), task)) }.boxed()
                })
                .await;
            if result.is_ok() {
                info!("Deleted {} listener(s) on {}/{}", unique.len(), region, lb_id);
            }
            fan_out(result.map(|()| vec![(); count]), count)
        }
        .boxed()
    })
}

fn target_dispatch(shared: &Arc<Shared>, register: bool) -> Dispatch<ListenerTarget, ()> {
    let shared = Arc::clone(shared);
    Arc::new(move |region: String, lb_id: String, targets: Vec<ListenerTarget>| {
        let shared = Arc::clone(&shared);
        async move {
            let count = targets.len();
            let targets = Arc::new(targets);
            let action = if register {
                "BatchRegisterTargets"
            } else {
                "BatchDeregisterTargets"
            };
            let result = shared
                .mutate(action, &region, &lb_id, || {
                    let api = Arc::clone(&shared.api);
                    let (region, lb_id, targets) = (region.clone(), lb_id.clone(), Arc::clone(&targets));
                    async move {
                        let task = if register {
                            api.register_targets(&region, &lb_id, &targets).await?
                        } else {
                            api.deregister_targets(&region, &lb_id, &targets).await?
                        };
                        Ok(((), task))
                    }
                    .boxed()
                })
                .await;
            debug!("{} {} target(s) on {}/{}: {:?}", action, count, region, lb_id, result.is_ok());
            fan_out(result.map(|()| vec![(); count]), count)
        }
        .boxed()
    })
}

/// CLB client exposing the operations reconcilers need
#[derive(Debug)]
pub struct ClbClient {
    shared: Arc<Shared>,
    quotas: DashMap<String, usize>,
    create_listeners: Batcher<CreateListenerRequest, String>,
    delete_listeners: Batcher<String, ()>,
    register_targets: Batcher<ListenerTarget, ()>,
    deregister_targets: Batcher<ListenerTarget, ()>,
}

impl ClbClient {
    /// Creates the client and spawns its batch workers.
    ///
    /// Must be called from within a Tokio runtime. Cancelling `cancel` stops
    /// the workers and aborts every pending wait.
    pub fn new(api: Arc<dyn ClbApi>, config: ClbClientConfig, cancel: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            api,
            locks: LbLocks::new(),
            retry: config.retry,
            cancel: cancel.clone(),
        });
        Self {
            create_listeners: Batcher::spawn(
                "CreateListener",
                config.batch,
                cancel.clone(),
                create_listener_dispatch(&shared),
            ),
            delete_listeners: Batcher::spawn(
                "DeleteListener",
                config.batch,
                cancel.clone(),
                delete_listener_dispatch(&shared),
            ),
            register_targets: Batcher::spawn(
                "RegisterTargets",
                config.batch,
                cancel.clone(),
                target_dispatch(&shared, true),
            ),
            deregister_targets: Batcher::spawn("DeregisterTargets", config.batch, cancel, target_dispatch(&shared, false)),
            quotas: DashMap::new(),
            shared,
        }
    }

    /// Token that stops this client.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    async fn read<T, F, Fut>(&self, action: &str, call: F) -> Result<T, ClbError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClbError>>,
    {
        retry_rate_limited(&self.shared.retry, &self.shared.cancel, action, call).await
    }

    /// Creates a listener for an allocated port and returns its ID.
    pub async fn allocate_create_listener(
        &self,
        region: &str,
        lb_id: &str,
        port: u16,
        end_port: Option<u16>,
        protocol: &str,
        extra: &ListenerExtra,
    ) -> Result<String, ClbError> {
        let request = CreateListenerRequest {
            port,
            end_port,
            protocol: protocol.to_string(),
            listener_name: extra.name.clone(),
            certificate_id: extra.certificate_id.clone(),
        };
        self.create_listeners.submit(region, lb_id, request).await
    }

    /// Finds the listener bound to `port`/`protocol`.
    pub async fn get_listener_by_port(
        &self,
        region: &str,
        lb_id: &str,
        port: u16,
        protocol: &str,
    ) -> Result<Option<Listener>, ClbError> {
        let listeners = self
            .read("DescribeListeners", || {
                self.shared.api.describe_listeners(region, lb_id, Some(port), Some(protocol))
            })
            .await?;
        Ok(listeners
            .into_iter()
            .find(|l| l.port == port && l.protocol.eq_ignore_ascii_case(protocol)))
    }

    /// Deletes one listener.
    pub async fn delete_listener(&self, region: &str, lb_id: &str, listener_id: &str) -> Result<(), ClbError> {
        self.delete_listeners.submit(region, lb_id, listener_id.to_string()).await
    }

    /// Deletes the listener bound to `port`/`protocol`, if any.
    pub async fn delete_listener_by_port(&self, region: &str, lb_id: &str, port: u16, protocol: &str) -> Result<(), ClbError> {
        match self.get_listener_by_port(region, lb_id, port, protocol).await? {
            Some(listener) => self.delete_listener(region, lb_id, &listener.listener_id).await,
            None => Ok(()),
        }
    }

    /// Registers backends on a listener.
    pub async fn register_targets(&self, region: &str, lb_id: &str, listener_id: &str, targets: &[Target]) -> Result<(), ClbError> {
        try_join_all(targets.iter().map(|t| {
            self.register_targets.submit(
                region,
                lb_id,
                ListenerTarget {
                    listener_id: listener_id.to_string(),
                    ip: t.ip.clone(),
                    port: t.port,
                },
            )
        }))
        .await?;
        Ok(())
    }

    /// Deregisters backends from a listener.
    pub async fn deregister_targets(
        &self,
        region: &str,
        lb_id: &str,
        listener_id: &str,
        targets: &[Target],
    ) -> Result<(), ClbError> {
        try_join_all(targets.iter().map(|t| {
            self.deregister_targets.submit(
                region,
                lb_id,
                ListenerTarget {
                    listener_id: listener_id.to_string(),
                    ip: t.ip.clone(),
                    port: t.port,
                },
            )
        }))
        .await?;
        Ok(())
    }

    /// Backends currently registered on a listener.
    pub async fn describe_targets(&self, region: &str, lb_id: &str, listener_id: &str) -> Result<Vec<Target>, ClbError> {
        let ids = [listener_id.to_string()];
        let listeners = self
            .read("DescribeTargets", || self.shared.api.describe_targets(region, lb_id, &ids))
            .await?;
        Ok(listeners
            .into_iter()
            .find(|l| l.listener_id == listener_id)
            .map(|l| l.targets)
            .unwrap_or_default())
    }

    /// Listener slots per load balancer in a region, cached after the first query.
    pub async fn get_quota(&self, region: &str) -> Result<usize, ClbError> {
        if let Some(quota) = self.quotas.get(region) {
            return Ok(*quota);
        }
        let quotas = self
            .read("DescribeQuota", || self.shared.api.describe_quota(region))
            .await?;
        let quota = quotas
            .iter()
            .find(|q| q.quota_id == LISTENER_QUOTA_ID)
            .map(|q| usize::try_from(q.quota_limit).unwrap_or(usize::MAX))
            .ok_or_else(|| ClbError::Api {
                code: "QuotaNotFound".to_string(),
                message: format!("{LISTENER_QUOTA_ID} missing in {region}"),
            })?;
        info!("Listener quota in {} is {}", region, quota);
        self.quotas.insert(region.to_string(), quota);
        Ok(quota)
    }

    /// Describes load balancers; missing IDs are absent from the result.
    pub async fn describe_load_balancers(&self, region: &str, lb_ids: &[String]) -> Result<Vec<LoadBalancer>, ClbError> {
        if lb_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.read("DescribeLoadBalancers", || {
            self.shared.api.describe_load_balancers(region, lb_ids)
        })
        .await
    }

    /// Creates a public load balancer and returns its ID.
    pub async fn create_load_balancer(
        &self,
        region: &str,
        name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<String, ClbError> {
        let request = CreateLoadBalancerRequest::new(name, parameters);
        let (lb_id, task_id) = self
            .read("CreateLoadBalancer", || self.shared.api.create_load_balancer(region, &request))
            .await?;
        wait_task(self.shared.api.as_ref(), &self.shared.retry, &self.shared.cancel, region, &task_id).await?;
        info!("Created load balancer {} ({}) in {}", lb_id, name, region);
        Ok(lb_id)
    }

    /// Deletes a load balancer.
    pub async fn delete_load_balancer(&self, region: &str, lb_id: &str) -> Result<(), ClbError> {
        let ids = Arc::new(vec![lb_id.to_string()]);
        self.shared
            .mutate("DeleteLoadBalancer", region, lb_id, || {
                let api = Arc::clone(&self.shared.api);
                let (region, ids) = (region.to_string(), Arc::clone(&ids));
                async move { api.delete_load_balancers(&region, &ids).await.map(|task| ((), task)) }.boxed()
            })
            .await?;
        info!("Deleted load balancer {} in {}", lb_id, region);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockClbApi;
    use std::time::Duration;

    fn client(api: &MockClbApi) -> ClbClient {
        let config = ClbClientConfig {
            batch: BatchConfig {
                max_tasks: 10,
                window: Duration::from_millis(20),
            },
            retry: RetryPolicy {
                rate_limit_attempts: 5,
                rate_limit_interval: Duration::from_millis(5),
                task_poll_attempts: 5,
                task_poll_interval: Duration::from_millis(5),
            },
        };
        ClbClient::new(Arc::new(api.clone()), config, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_listener_lifecycle() {
        let api = MockClbApi::new();
        api.add_load_balancer("lb-1", &["1.1.1.1"]);
        let clb = client(&api);

        let id = clb
            .allocate_create_listener("ap-test", "lb-1", 30000, None, "TCP", &ListenerExtra::default())
            .await
            .unwrap();
        let found = clb.get_listener_by_port("ap-test", "lb-1", 30000, "TCP").await.unwrap();
        assert_eq!(found.map(|l| l.listener_id), Some(id.clone()));
        assert!(clb
            .get_listener_by_port("ap-test", "lb-1", 30000, "UDP")
            .await
            .unwrap()
            .is_none());

        clb.register_targets("ap-test", "lb-1", &id, &[Target::new("10.0.0.5", 80)])
            .await
            .unwrap();
        assert_eq!(
            clb.describe_targets("ap-test", "lb-1", &id).await.unwrap(),
            vec![Target::new("10.0.0.5", 80)]
        );
        clb.deregister_targets("ap-test", "lb-1", &id, &[Target::new("10.0.0.5", 80)])
            .await
            .unwrap();
        assert!(api.targets(&id).is_empty());

        clb.delete_listener_by_port("ap-test", "lb-1", 30000, "TCP").await.unwrap();
        assert!(api.listeners("lb-1").is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_batched_per_lb() {
        let api = MockClbApi::new();
        api.add_load_balancer("lb-1", &[]);
        api.add_load_balancer("lb-2", &[]);
        let clb = client(&api);

        let extra = ListenerExtra::default();
        let requests = [("lb-1", 30000), ("lb-2", 30000), ("lb-1", 30001), ("lb-2", 30001)];
        let ids = futures::future::join_all(
            requests
                .iter()
                .map(|(lb, port)| clb.allocate_create_listener("ap-test", lb, *port, None, "UDP", &extra)),
        )
        .await;
        assert!(ids.iter().all(Result::is_ok));

        let creates = api.calls_of("CreateListener");
        assert_eq!(creates.len(), 2);
        assert!(creates.iter().all(|c| c.items == 2));
    }

    #[tokio::test]
    async fn test_rate_limited_create_is_retried() {
        let api = MockClbApi::new();
        api.add_load_balancer("lb-1", &[]);
        let clb = client(&api);
        api.rate_limit_next(2);

        let id = clb
            .allocate_create_listener("ap-test", "lb-1", 30000, None, "TCP", &ListenerExtra::default())
            .await;
        assert!(id.is_ok());
        assert_eq!(api.calls_of("CreateListener").len(), 3);
    }

    #[tokio::test]
    async fn test_missing_lb_surfaces_not_found() {
        let api = MockClbApi::new();
        let clb = client(&api);
        let err = clb
            .allocate_create_listener("ap-test", "lb-gone", 30000, None, "TCP", &ListenerExtra::default())
            .await
            .unwrap_err();
        assert!(err.is_lb_not_found());
        let err = clb.get_listener_by_port("ap-test", "lb-gone", 30000, "TCP").await.unwrap_err();
        assert!(err.is_lb_not_found());
    }

    #[tokio::test]
    async fn test_listener_quota_exceeded_fans_out() {
        let api = MockClbApi::new();
        api.add_load_balancer("lb-1", &[]);
        api.set_listener_quota(1);
        let clb = client(&api);

        let extra = ListenerExtra::default();
        let results = futures::future::join_all(
            [30000, 30001].map(|port| clb.allocate_create_listener("ap-test", "lb-1", port, None, "TCP", &extra)),
        )
        .await;
        assert!(results.iter().all(|r| r.as_ref().is_err_and(ClbError::is_quota_exceeded)));
    }

    #[tokio::test]
    async fn test_quota_is_cached() {
        let api = MockClbApi::new();
        api.set_listener_quota(80);
        let clb = client(&api);
        assert_eq!(clb.get_quota("ap-test").await.unwrap(), 80);
        assert_eq!(clb.get_quota("ap-test").await.unwrap(), 80);
        assert_eq!(api.calls_of("DescribeQuota").len(), 1);
    }

    #[tokio::test]
    async fn test_load_balancer_create_describe_delete() {
        let api = MockClbApi::new();
        let clb = client(&api);
        let id = clb.create_load_balancer("ap-test", "pool-a-1", &BTreeMap::new()).await.unwrap();
        let lbs = clb.describe_load_balancers("ap-test", &[id.clone(), "lb-x".into()]).await.unwrap();
        assert_eq!(lbs.len(), 1);
        assert_eq!(lbs[0].load_balancer_name, "pool-a-1");

        clb.delete_load_balancer("ap-test", &id).await.unwrap();
        assert!(!api.has_load_balancer(&id));
    }

    #[tokio::test]
    async fn test_cancelled_client_refuses_work() {
        let api = MockClbApi::new();
        api.add_load_balancer("lb-1", &[]);
        let clb = client(&api);
        clb.cancellation_token().cancel();
        let err = clb.get_listener_by_port("ap-test", "lb-1", 1, "TCP").await.unwrap_err();
        assert!(matches!(err, ClbError::Cancelled));
    }
}
