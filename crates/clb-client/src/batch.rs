//! Request batching.
//!
//! Callers submit single tasks and await their own result. A worker drains
//! the queue until either `max_tasks` are pending or the window since the
//! first task elapsed, groups the tasks by load balancer and dispatches every
//! group on its own spawned task.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ClbError;

/// Batch sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Dispatch as soon as this many tasks are pending
    pub max_tasks: usize,
    /// Dispatch at the latest this long after the first pending task
    pub window: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_tasks: 20,
            window: Duration::from_millis(200),
        }
    }
}

/// Executes one group of tasks against one load balancer.
///
/// Receives `(region, lb_id, tasks)` and returns one result per task, in order.
pub type Dispatch<T, R> = Arc<dyn Fn(String, String, Vec<T>) -> BoxFuture<'static, Vec<Result<R, ClbError>>> + Send + Sync>;

struct Pending<T, R> {
    region: String,
    lb_id: String,
    task: T,
    reply: oneshot::Sender<Result<R, ClbError>>,
}

/// Handle for submitting tasks to a batch worker
pub struct Batcher<T, R> {
    name: &'static str,
    tx: mpsc::Sender<Pending<T, R>>,
    cancel: CancellationToken,
}

impl<T, R> fmt::Debug for Batcher<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batcher").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<T, R> Batcher<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Spawns the worker. It stops when `cancel` fires or every handle is dropped.
    pub fn spawn(name: &'static str, config: BatchConfig, cancel: CancellationToken, dispatch: Dispatch<T, R>) -> Self {
        let (tx, rx) = mpsc::channel(config.max_tasks.max(1) * 16);
        tokio::spawn(run(name, rx, config, cancel.clone(), dispatch));
        Self { name, tx, cancel }
    }

    /// Queues a task and waits for its result.
    pub async fn submit(&self, region: &str, lb_id: &str, task: T) -> Result<R, ClbError> {
        let (reply, rx) = oneshot::channel();
        let pending = Pending {
            region: region.to_string(),
            lb_id: lb_id.to_string(),
            task,
            reply,
        };
        if self.tx.send(pending).await.is_err() {
            return Err(self.closed());
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.closed()),
        }
    }

    fn closed(&self) -> ClbError {
        if self.cancel.is_cancelled() {
            ClbError::Cancelled
        } else {
            ClbError::BatchClosed
        }
    }
}

async fn run<T, R>(
    name: &'static str,
    mut rx: mpsc::Receiver<Pending<T, R>>,
    config: BatchConfig,
    cancel: CancellationToken,
    dispatch: Dispatch<T, R>,
) where
    T: Send + 'static,
    R: Send + 'static,
{
    loop {
        let first = tokio::select! {
            () = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let mut batch = vec![first];
        let deadline = Instant::now() + config.window;
        while batch.len() < config.max_tasks {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) | Err(_) => break,
            }
        }

        let mut groups: HashMap<(String, String), Vec<Pending<T, R>>> = HashMap::new();
        for item in batch {
            groups
                .entry((item.region.clone(), item.lb_id.clone()))
                .or_default()
                .push(item);
        }
        debug!("{} batch: {} load balancer group(s)", name, groups.len());

        for ((region, lb_id), items) in groups {
            let dispatch = Arc::clone(&dispatch);
            tokio::spawn(async move {
                let (tasks, replies): (Vec<T>, Vec<_>) = items.into_iter().map(|p| (p.task, p.reply)).unzip();
                let results = dispatch(region, lb_id, tasks).await;
                for (reply, result) in replies.into_iter().zip(results) {
                    // Caller may have given up
                    let _ = reply.send(result);
                }
            });
        }
    }
    debug!("{} batch worker stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<(String, Vec<u32>)>>>;

    fn recording(seen: &Seen) -> Dispatch<u32, u32> {
        let seen = Arc::clone(seen);
        Arc::new(move |_region: String, lb_id: String, tasks: Vec<u32>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push((lb_id, tasks.clone()));
                tasks.into_iter().map(|t| Ok(t * 10)).collect()
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_batches_group_by_lb() {
        let seen: Seen = Arc::default();
        let batcher = Arc::new(Batcher::spawn(
            "test",
            BatchConfig {
                max_tasks: 10,
                window: Duration::from_millis(50),
            },
            CancellationToken::new(),
            recording(&seen),
        ));

        let calls = [("lb-1", 1), ("lb-2", 2), ("lb-1", 3), ("lb-1", 4), ("lb-2", 5)];
        let results = futures::future::join_all(calls.iter().map(|(lb, t)| {
            let batcher = Arc::clone(&batcher);
            async move { batcher.submit("ap-test", lb, *t).await.unwrap() }
        }))
        .await;
        assert_eq!(results, vec![10, 20, 30, 40, 50]);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "lb-1");
        assert_eq!(seen[0].1.len(), 3);
        assert_eq!(seen[1].1.len(), 2);
    }

    #[tokio::test]
    async fn test_size_threshold_splits_batches() {
        let seen: Seen = Arc::default();
        let batcher = Arc::new(Batcher::spawn(
            "test",
            BatchConfig {
                max_tasks: 2,
                window: Duration::from_millis(50),
            },
            CancellationToken::new(),
            recording(&seen),
        ));

        futures::future::join_all((0..4).map(|t| {
            let batcher = Arc::clone(&batcher);
            async move { batcher.submit("ap-test", "lb-1", t).await.unwrap() }
        }))
        .await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.iter().map(|(_, t)| t.len()).sum::<usize>(), 4);
        assert!(seen.iter().all(|(_, t)| t.len() <= 2));
    }

    #[tokio::test]
    async fn test_cancelled_worker_reports_cancelled() {
        let cancel = CancellationToken::new();
        let batcher: Batcher<u32, u32> = Batcher::spawn(
            "test",
            BatchConfig::default(),
            cancel.clone(),
            Arc::new(|_: String, _: String, _: Vec<u32>| async { Vec::<Result<u32, ClbError>>::new() }.boxed()),
        );
        cancel.cancel();
        tokio::task::yield_now().await;
        let err = batcher.submit("ap-test", "lb-1", 1).await.unwrap_err();
        assert!(matches!(err, ClbError::Cancelled));
    }
}
