//! Detached work that outlives the event that started it: cache writes,
//! revalidations and opportunistic sweeps.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinSet;
use tracing::error;

#[derive(Debug, Default)]
pub struct BackgroundTasks {
    set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = match self.set.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Reap finished tasks so a long-lived worker doesn't accumulate them
        while let Some(result) = set.try_join_next() {
            log_panic(result);
        }
        set.spawn(task);
    }

    /// Wait until every task spawned so far, and any they spawn, has finished.
    pub async fn settle(&self) {
        loop {
            let mut pending = {
                let mut set = match self.set.lock() {
                    Ok(set) => set,
                    Err(poisoned) => poisoned.into_inner(),
                };
                std::mem::take(&mut *set)
            };
            if pending.is_empty() {
                return;
            }
            while let Some(result) = pending.join_next().await {
                log_panic(result);
            }
        }
    }
}

fn log_panic(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Background task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_settle_waits_for_all_tasks() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.settle().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_settle_with_nothing_pending() {
        BackgroundTasks::new().settle().await;
    }
}
