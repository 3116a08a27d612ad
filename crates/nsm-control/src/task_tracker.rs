//! Task tracking for per-dataplane background tasks
//!
//! Each tracked task owns a cancellation token. Replacing or unregistering a
//! task cancels it; `shutdown` cancels every task and waits for all of them.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TrackedTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks background tasks keyed by dataplane name
#[derive(Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, TrackedTask>>,
}

impl TaskTracker {
    /// Create a new task tracker
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task for a dataplane
    ///
    /// A previous task under the same name is cancelled. Tasks that already
    /// finished on their own are dropped from the tracker.
    pub fn register(&self, name: String, token: CancellationToken, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|_, task| !task.handle.is_finished());
            if let Some(old) = tasks.insert(name, TrackedTask { token, handle }) {
                old.token.cancel();
            }
        }
    }

    /// Cancel the task of a dataplane without waiting for it
    ///
    /// Returns true if a task was tracked under the name.
    pub fn cancel(&self, name: &str) -> bool {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(task) = tasks.remove(name) {
                task.token.cancel();
                return true;
            }
        }
        false
    }

    /// Number of tracked tasks that are still running
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.values().filter(|t| !t.handle.is_finished()).count())
            .unwrap_or(0)
    }

    /// Cancel every tracked task and wait for all of them to finish
    pub async fn shutdown(&self) {
        let drained: Vec<(String, TrackedTask)> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain().collect(),
            Err(_) => return,
        };

        for (_, task) in &drained {
            task.token.cancel();
        }

        for (name, task) in drained {
            if let Err(e) = task.handle.await {
                tracing::warn!(dataplane = %name, "Tracked task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn_cancellable(token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { token.cancelled().await })
    }

    #[tokio::test]
    async fn test_register_and_cancel() {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        tracker.register("dp1".to_string(), token.clone(), spawn_cancellable(token.clone()));

        assert!(tracker.cancel("dp1"));
        assert!(token.is_cancelled());
        assert!(!tracker.cancel("dp1"));
        assert_eq!(tracker.tasks.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_replacing_task_cancels_previous() {
        let tracker = TaskTracker::new();

        let first = CancellationToken::new();
        tracker.register("dp1".to_string(), first.clone(), spawn_cancellable(first.clone()));

        let second = CancellationToken::new();
        tracker.register("dp1".to_string(), second.clone(), spawn_cancellable(second.clone()));

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(tracker.tasks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_joins_all_tasks() {
        let tracker = TaskTracker::new();
        let mut tokens = Vec::new();
        for name in ["dp1", "dp2", "dp3"] {
            let token = CancellationToken::new();
            tracker.register(name.to_string(), token.clone(), spawn_cancellable(token.clone()));
            tokens.push(token);
        }
        assert_eq!(tracker.active(), 3);

        tokio::time::timeout(Duration::from_secs(1), tracker.shutdown())
            .await
            .expect("shutdown should join cancelled tasks");

        assert!(tokens.iter().all(|t| t.is_cancelled()));
        assert_eq!(tracker.active(), 0);
    }
}
