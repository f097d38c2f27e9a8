//! Tracked task spawning
//!
//! Every background task a service starts goes through a [`TaskManager`] so
//! it can be counted, bounded and cancelled on shutdown.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::types::{Error, Result};

struct TrackedTask {
    id: u64,
    name: String,
    handle: JoinHandle<()>,
    started_at: Instant,
}

/// Task manager for one service layer
pub struct TaskManager {
    layer_name: String,
    next_task_id: AtomicU64,
    tasks: Mutex<Vec<TrackedTask>>,
    active_count: Arc<AtomicUsize>,
    cancel_token: CancellationToken,
    max_tasks: usize,
    shutdown_timeout: Duration,
}

/// Point-in-time task counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStats {
    pub layer_name: String,
    pub tracked_tasks: usize,
    pub active_tasks: usize,
    pub spawned_total: u64,
}

impl TaskManager {
    pub fn new(layer_name: impl Into<String>) -> Self {
        Self::with_config(layer_name, 10_000, Duration::from_secs(5))
    }

    pub fn with_config(layer_name: impl Into<String>, max_tasks: usize, shutdown_timeout: Duration) -> Self {
        Self {
            layer_name: layer_name.into(),
            next_task_id: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            active_count: Arc::new(AtomicUsize::new(0)),
            cancel_token: CancellationToken::new(),
            max_tasks,
            shutdown_timeout,
        }
    }

    /// Spawn a task that is cancelled when the manager shuts down
    pub fn spawn_tracked<F>(&self, name: impl Into<String>, future: F) -> Result<u64>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel_token.is_cancelled() {
            return Err(Error::task(format!("{} is shutting down", self.layer_name)));
        }

        let active = self.active_count.load(Ordering::SeqCst);
        if active >= self.max_tasks {
            return Err(Error::task(format!(
                "task limit reached for {}: {} active tasks",
                self.layer_name, active
            )));
        }

        let task_name = name.into();
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let cancel_token = self.cancel_token.clone();
        let active_count = self.active_count.clone();
        let layer_name = self.layer_name.clone();
        let log_name = task_name.clone();

        active_count.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = future => {
                    debug!(task = %log_name, id = task_id, layer = %layer_name, "task completed");
                }
                _ = cancel_token.cancelled() => {
                    debug!(task = %log_name, id = task_id, layer = %layer_name, "task cancelled");
                }
            }
            active_count.fetch_sub(1, Ordering::SeqCst);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(TrackedTask {
            id: task_id,
            name: task_name,
            handle,
            started_at: Instant::now(),
        });

        Ok(task_id)
    }

    /// Spawn a task that starts after `delay`
    ///
    /// The wait is a timer inside the task, so cancelling the manager drops
    /// pending delayed work as well.
    pub fn spawn_delayed<F>(&self, name: impl Into<String>, delay: Duration, future: F) -> Result<u64>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_tracked(name, async move {
            tokio::time::sleep(delay).await;
            future.await;
        })
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for long running loops that must stop with the manager
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    pub fn stats(&self) -> TaskStats {
        let tasks = self.tasks.lock();
        TaskStats {
            layer_name: self.layer_name.clone(),
            tracked_tasks: tasks.iter().filter(|t| !t.handle.is_finished()).count(),
            active_tasks: self.active_count(),
            spawned_total: self.next_task_id.load(Ordering::SeqCst),
        }
    }

    /// Cancel every task, then wait up to the shutdown timeout before aborting stragglers
    pub async fn shutdown(&self) {
        debug!(layer = %self.layer_name, active = self.active_count(), "shutting down tasks");
        self.cancel_token.cancel();

        let deadline = Instant::now() + self.shutdown_timeout;
        while self.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let tasks: Vec<TrackedTask> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks.iter().filter(|t| !t.handle.is_finished()) {
            warn!(
                task = %task.name,
                id = task.id,
                runtime = ?task.started_at.elapsed(),
                "force aborting task"
            );
            task.handle.abort();
        }
    }
}
