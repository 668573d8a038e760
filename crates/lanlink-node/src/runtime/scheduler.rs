//! Task orchestration over the async runtime.
//!
//! Every long-lived loop and every fire-and-forget unit of work in the node
//! goes through a [`Scheduler`]. Centralizing spawning buys two things:
//! failures of detached tasks are reported through one configurable hook
//! instead of vanishing, and blocking work (DNS resolution, JSON decoding of
//! large frames) is pushed onto the blocking pool in one place.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, select_all};
use tracing::error;

/// Called when a detached task finishes with an error. Receives the task
/// name given at spawn time and the error itself.
pub type TaskErrorHook = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

/// Spawns and coordinates the node's background tasks.
///
/// Cheap to clone; every component holds its own handle.
#[derive(Clone)]
pub struct Scheduler {
    on_task_error: TaskErrorHook,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler whose error hook logs through `tracing`.
    pub fn new() -> Self {
        Self {
            on_task_error: Arc::new(|name, err| {
                error!(task = name, error = %format!("{err:#}"), "background task failed");
            }),
        }
    }

    /// Creates a scheduler with a custom failure hook. Used by tests to
    /// observe task outcomes.
    pub fn with_error_hook(on_task_error: TaskErrorHook) -> Self {
        Self { on_task_error }
    }

    /// Spawns a detached task. If the task resolves to an error, the error
    /// hook is invoked with `name`; the task's success value is discarded.
    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let hook = Arc::clone(&self.on_task_error);
        let name = name.to_owned();
        tokio::spawn(async move {
            if let Err(err) = future.await {
                hook(&name, &err);
            }
        });
    }

    /// Runs a blocking closure on the blocking thread pool and awaits its
    /// result without stalling the async workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the blocking task panics or is cancelled at
    /// runtime shutdown.
    pub async fn run_in_thread<F, T>(&self, work: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|err| anyhow::anyhow!("blocking task aborted: {err}"))
    }

    /// Suspends the calling task for `duration`.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Drives all futures to completion and returns their outputs in input
    /// order.
    pub async fn wait_all<F, T>(&self, futures: Vec<F>) -> Vec<T>
    where
        F: Future<Output = T>,
    {
        join_all(futures).await
    }

    /// Races the futures and returns the output of whichever finishes
    /// first; the rest are dropped. `futures` must be non-empty.
    pub async fn wait_first<F, T>(&self, futures: Vec<F>) -> T
    where
        F: Future<Output = T> + Unpin,
    {
        let (output, _index, _rest) = select_all(futures).await;
        output
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_spawn_runs_task_to_completion() {
        let scheduler = Scheduler::new();
        let (tx, rx) = oneshot::channel();
        scheduler.spawn("unit", async move {
            tx.send(42).ok();
            Ok(())
        });
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_spawn_reports_failure_through_hook() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();
        let hook: TaskErrorHook = {
            let seen = Arc::clone(&seen);
            let tx = Mutex::new(Some(tx));
            Arc::new(move |name, err| {
                seen.lock().unwrap().push((name.to_owned(), err.to_string()));
                if let Some(tx) = tx.lock().unwrap().take() {
                    tx.send(()).ok();
                }
            })
        };
        let scheduler = Scheduler::with_error_hook(hook);
        scheduler.spawn("doomed", async { Err(anyhow::anyhow!("boom")) });
        rx.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "doomed");
        assert_eq!(seen[0].1, "boom");
    }

    #[tokio::test]
    async fn test_run_in_thread_returns_closure_output() {
        let scheduler = Scheduler::new();
        let sum = scheduler
            .run_in_thread(|| (1..=10).sum::<u32>())
            .await
            .unwrap();
        assert_eq!(sum, 55);
    }

    #[tokio::test]
    async fn test_run_in_thread_surfaces_panic_as_error() {
        let scheduler = Scheduler::new();
        let result: anyhow::Result<()> = scheduler
            .run_in_thread(|| panic!("deliberate"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_wait_all_preserves_input_order() {
        let scheduler = Scheduler::new();
        let futures = vec![
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                1
            }
            .boxed(),
            async { 2 }.boxed(),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                3
            }
            .boxed(),
        ];
        assert_eq!(scheduler.wait_all(futures).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_wait_first_returns_fastest_output() {
        let scheduler = Scheduler::new();
        let futures = vec![
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "slow"
            }
            .boxed(),
            async { "fast" }.boxed(),
        ];
        assert_eq!(scheduler.wait_first(futures).await, "fast");
    }
}
