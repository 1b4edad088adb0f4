//! Rate-limit retry and task polling.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clb_trait::ClbApi;
use crate::error::ClbError;
use crate::models::TaskStatus;

/// Retry and polling budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call when the provider rate-limits, including the first
    pub rate_limit_attempts: u32,
    /// Pause between rate-limited attempts
    pub rate_limit_interval: Duration,
    /// Status polls per asynchronous task
    pub task_poll_attempts: u32,
    /// Pause between status polls
    pub task_poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_attempts: 10,
            rate_limit_interval: Duration::from_secs(1),
            task_poll_attempts: 60,
            task_poll_interval: Duration::from_millis(500),
        }
    }
}

async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<(), ClbError> {
    tokio::select! {
        () = cancel.cancelled() => Err(ClbError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Runs `call`, repeating it while the provider answers with a rate-limit error.
pub async fn retry_rate_limited<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    action: &str,
    mut call: F,
) -> Result<T, ClbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClbError>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(ClbError::Cancelled);
        }
        match call().await {
            Err(e) if e.is_rate_limited() && attempt < policy.rate_limit_attempts => {
                warn!(
                    "{} rate limited (attempt {}/{}), retrying in {:?}",
                    action, attempt, policy.rate_limit_attempts, policy.rate_limit_interval
                );
                attempt += 1;
                pause(cancel, policy.rate_limit_interval).await?;
            }
            result => return result,
        }
    }
}

/// Polls a provider task until it finishes.
pub async fn wait_task(
    api: &dyn ClbApi,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    region: &str,
    task_id: &str,
) -> Result<(), ClbError> {
    for _ in 0..policy.task_poll_attempts {
        let (status, message) =
            retry_rate_limited(policy, cancel, "DescribeTaskStatus", || api.describe_task_status(region, task_id)).await?;
        match status {
            TaskStatus::Succeeded => {
                debug!("Task {} succeeded", task_id);
                return Ok(());
            }
            TaskStatus::Failed => {
                return Err(ClbError::TaskFailed {
                    task_id: task_id.to_string(),
                    message: message.unwrap_or_default(),
                });
            }
            TaskStatus::Running => pause(cancel, policy.task_poll_interval).await?,
        }
    }
    Err(ClbError::TaskTimeout(task_id.to_string()))
}
