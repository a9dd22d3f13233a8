//! Bounded fan-out of invocation tasks.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Runs submitted tasks with at most `max_concurrency` of them in flight.
///
/// Submission never blocks and never fails loudly: a task submitted after
/// [`FanOutPool::cancel`] is dropped and reported through the return value.
pub struct FanOutPool {
    name: &'static str,
    max_concurrency: usize,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl FanOutPool {
    pub fn new(name: &'static str, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            name,
            max_concurrency,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            active: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Queue `task`. Returns `false` if the pool no longer accepts work.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancellation_token.is_cancelled() {
            return false;
        }
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return false;
        };

        let semaphore = self.semaphore.clone();
        let token = self.cancellation_token.clone();
        let active = self.active.clone();
        let name = self.name;
        join_set.spawn(async move {
            let _permit = tokio::select! {
                _ = token.cancelled() => {
                    debug!(pool = name, "Task cancelled before it started");
                    return;
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            active.fetch_add(1, Ordering::SeqCst);
            task.await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
        true
    }

    /// Wait for every submitted task. The pool accepts no work afterwards.
    pub async fn join(&self) {
        let join_set = self.tasks.lock().take();
        let Some(mut join_set) = join_set else {
            return;
        };
        info!(pool = self.name, tasks = join_set.len(), max_concurrency = self.max_concurrency, "Waiting for fan-out");
        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                error!(pool = self.name, error = %e, "Fan-out task failed");
            }
        }
    }

    /// Stop starting queued tasks. Running tasks are not interrupted.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = FanOutPool::new("test", 2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let peak = peak.clone();
            let current = current.clone();
            assert!(pool.submit(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        pool.join().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(current.load(Ordering::SeqCst), 0);
        assert!(!pool.submit(async {}));
    }

    #[tokio::test]
    async fn test_cancel_rejects_new_work() {
        let pool = FanOutPool::new("test", 1);
        pool.cancel();
        assert!(!pool.is_running());
        assert!(!pool.submit(async {}));
        pool.join().await;
        assert_eq!(pool.active_count(), 0);
    }
}
