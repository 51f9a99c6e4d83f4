use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinSet;

/// A group of timer tasks that can be cancelled together.
///
/// Dropping the set aborts everything still pending.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Mutex<JoinSet<()>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a task in this group. Must be called from inside a tokio runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.tasks.lock() {
            Ok(mut tasks) => {
                // Reap finished tasks so long-lived sets stay small
                while tasks.try_join_next().is_some() {}
                tasks.spawn(task);
            }
            Err(_) => tracing::error!("Task set lock poisoned, dropping task"),
        }
    }

    /// Run a task once after `delay`
    pub fn spawn_after<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
    }

    /// Run `tick` every `period`, first after one full period
    pub fn spawn_every<F, Fut>(&self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
    }

    /// Cancel every pending task in this group
    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.abort_all();
            while tasks.try_join_next().is_some() {}
        }
    }

    /// Cancel every pending task and wait until they are gone
    pub async fn shutdown(&self) {
        let mut tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        tasks.shutdown().await;
    }

    /// Number of tasks still pending
    pub fn len(&self) -> usize {
        match self.tasks.lock() {
            Ok(mut tasks) => {
                while tasks.try_join_next().is_some() {}
                tasks.len()
            }
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_spawn_after_runs_once() {
        let set = TaskSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        set.spawn_after(Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_cancels_pending() {
        let set = TaskSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for delay in [100, 200, 300] {
            let counter = hits.clone();
            set.spawn_after(Duration::from_millis(delay), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        set.abort_all();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_every_ticks() {
        let set = TaskSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        set.spawn_every(Duration::from_secs(3), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
