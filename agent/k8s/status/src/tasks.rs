use ahash::AHashMap as HashMap;
use anyhow::Result;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// A registry of named, long-lived reconciliation tasks.
///
/// At most one task runs per name: upserting a name replaces (and cancels)
/// any task already registered under it. A task body that fails is retried
/// after a fixed delay until it succeeds, is replaced, or is removed.
pub struct StatusTasks {
    tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    retry_delay: Duration,
    shutdown: drain::Watch,
}

// === impl StatusTasks ===

impl StatusTasks {
    pub fn new(shutdown: drain::Watch, retry_delay: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::default()),
            retry_delay,
            shutdown,
        }
    }

    /// Registers (or replaces) the task body run under `name`.
    pub fn upsert<F, Fut>(&self, name: impl Into<String>, body: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let shutdown = self.shutdown.clone();
        let retry_delay = self.retry_delay;
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let signaled = shutdown.signaled();
            tokio::pin!(signaled);
            loop {
                tokio::select! {
                    _ = &mut signaled => return,
                    res = body() => match res {
                        Ok(()) => {
                            debug!(task = %task_name, "task complete");
                            return;
                        }
                        Err(error) => {
                            warn!(task = %task_name, %error, "task failed; will retry");
                        }
                    }
                }
                tokio::select! {
                    _ = &mut signaled => return,
                    _ = time::sleep(retry_delay) => {}
                }
            }
        });

        let mut tasks = self.tasks.lock();
        if let Some(old) = tasks.insert(name, handle) {
            old.abort();
        }
    }

    /// Cancels the task registered under `name`, if any.
    pub fn remove(&self, name: &str) {
        if let Some(handle) = self.tasks.lock().remove(name) {
            handle.abort();
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn mk_tasks(retry: Duration) -> (StatusTasks, drain::Signal) {
        let (signal, shutdown) = drain::channel();
        (StatusTasks::new(shutdown, retry), signal)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn upsert_replaces_running_tasks() {
        let (tasks, _signal) = mk_tasks(Duration::from_secs(1));
        let first_runs = Arc::new(AtomicUsize::new(0));

        let runs = first_runs.clone();
        tasks.upsert("t", move || {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                // Never completes; must be cancelled by the replacement.
                futures::future::pending::<()>().await;
                Ok(())
            }
        });
        tokio::task::yield_now().await;
        assert_eq!(first_runs.load(Ordering::SeqCst), 1);

        let second_done = Arc::new(AtomicUsize::new(0));
        let done = second_done.clone();
        tasks.upsert("t", move || {
            let done = done.clone();
            async move {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(tasks.len(), 1);
        assert_eq!(second_done.load(Ordering::SeqCst), 1);
        assert_eq!(first_runs.load(Ordering::SeqCst), 1, "replaced task must not rerun");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_tasks_are_retried() {
        let (tasks, _signal) = mk_tasks(Duration::from_secs(1));
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        tasks.upsert("t", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient");
                }
                Ok(())
            }
        });

        time::sleep(Duration::from_secs(5)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3, "two failures then success");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn remove_cancels_tasks() {
        let (tasks, _signal) = mk_tasks(Duration::from_secs(1));
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        tasks.upsert("t", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("always fails")
            }
        });
        tokio::task::yield_now().await;
        tasks.remove("t");
        assert!(tasks.is_empty());

        let before = runs.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), before, "cancelled task must not retry");
    }
}
