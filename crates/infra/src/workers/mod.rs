//! Background task plumbing shared by the worker pool, the recovery sweeper
//! and the cache janitor.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to control and join a group of background tasks.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl TaskHandle {
    pub(crate) fn new(name: impl Into<String>, shutdown: watch::Sender<bool>) -> Self {
        Self {
            name: name.into(),
            shutdown,
            joins: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, join: JoinHandle<()>) {
        self.joins.push(join);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_count(&self) -> usize {
        self.joins.len()
    }

    /// Request graceful shutdown and wait for every task to stop.
    ///
    /// Tasks finish the cycle they are in; a job mid-analysis is either
    /// completed or left `processing` for the recovery sweeper.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(task = %self.name, error = %err, "background task ended abnormally");
            }
        }
        debug!(task = %self.name, "background tasks stopped");
    }
}

/// Spawn a task that runs `tick` every `interval` until shutdown.
///
/// The first tick runs after one full interval.
pub fn spawn_periodic<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let mut handle = TaskHandle::new(name, shutdown_tx);
    let task_name = handle.name.clone();

    handle.push(tokio::spawn(async move {
        debug!(task = %task_name, interval_ms = interval.as_millis() as u64, "periodic task started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => tick().await,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    handle
}

/// Sleep for `duration` unless shutdown is requested first.
/// Returns `true` when the caller should stop.
pub(crate) async fn sleep_or_shutdown(
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn periodic_task_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = spawn_periodic("test-ticker", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(handle.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.shutdown().await;

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1, "expected ticks, saw {seen}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn sleep_returns_early_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move {
            sleep_or_shutdown(Duration::from_secs(30), &mut rx).await
        });
        tx.send(true).unwrap();
        assert!(sleeper.await.unwrap());
    }
}
