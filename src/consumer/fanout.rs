use super::AclDelta;
use crate::error::{Result, RustAclError};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error};

/// Work for one affected role assignment
pub type AssignmentTask = BoxFuture<'static, Result<AclDelta>>;

/// Runs per-assignment tasks and waits for every one of them
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run all tasks, each tagged with its role assignment id. Returns the
    /// summed delta, or the first failure in submission order once every
    /// task has finished.
    async fn invoke_all(&self, tasks: Vec<(String, AssignmentTask)>) -> Result<AclDelta>;
}

/// Spawns tasks on the runtime with at most `max_concurrency` in flight
pub struct BoundedTaskExecutor {
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl BoundedTaskExecutor {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

#[async_trait]
impl TaskExecutor for BoundedTaskExecutor {
    async fn invoke_all(&self, tasks: Vec<(String, AssignmentTask)>) -> Result<AclDelta> {
        if tasks.is_empty() {
            return Ok(AclDelta::default());
        }
        debug!(
            "Fanning out {} assignment tasks over {} workers",
            tasks.len(),
            self.max_concurrency
        );

        let (ids, handles): (Vec<String>, Vec<_>) = tasks
            .into_iter()
            .map(|(id, task)| {
                let permits = self.permits.clone();
                let handle = tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| RustAclError::TaskAborted(e.to_string()))?;
                    task.await
                });
                (id, handle)
            })
            .unzip();

        let results = join_all(handles).await;

        let mut total = AclDelta::default();
        let mut first_failure = None;
        for (id, result) in ids.into_iter().zip(results) {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => Err(RustAclError::TaskAborted(e.to_string())),
            };
            match outcome {
                Ok(delta) => total += delta,
                Err(e) => {
                    error!("Task for role assignment {} failed: {}", id, e);
                    if first_failure.is_none() {
                        first_failure = Some(RustAclError::TaskFailed {
                            assignment_id: id,
                            source: Box::new(e),
                        });
                    }
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_sums_deltas() {
        let executor = BoundedTaskExecutor::new(2);
        let tasks: Vec<(String, AssignmentTask)> = (0..5)
            .map(|i| {
                let task: AssignmentTask = Box::pin(async move { Ok(AclDelta::new(i, 1)) });
                (format!("ra-{}", i), task)
            })
            .collect();

        let total = executor.invoke_all(tasks).await.unwrap();
        assert_eq!(total, AclDelta::new(10, 5));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let executor = BoundedTaskExecutor::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<(String, AssignmentTask)> = (0..12)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                let task: AssignmentTask = Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(AclDelta::new(1, 0))
                });
                (format!("ra-{}", i), task)
            })
            .collect();

        let total = executor.invoke_all(tasks).await.unwrap();
        assert_eq!(total.created, 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_failure_reported_after_all_tasks_finish() {
        let executor = BoundedTaskExecutor::new(4);
        let finished = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<(String, AssignmentTask)> = (0..4)
            .map(|i| {
                let finished = finished.clone();
                let task: AssignmentTask = Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(2 * i as u64)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    if i == 1 {
                        Err(RustAclError::Store("connection reset".to_string()))
                    } else {
                        Ok(AclDelta::new(1, 0))
                    }
                });
                (format!("ra-{}", i), task)
            })
            .collect();

        let err = executor.invoke_all(tasks).await.unwrap_err();
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        match err {
            RustAclError::TaskFailed { assignment_id, .. } => assert_eq!(assignment_id, "ra-1"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let executor = BoundedTaskExecutor::new(1);
        assert_eq!(executor.invoke_all(Vec::new()).await.unwrap(), AclDelta::default());
    }
}
