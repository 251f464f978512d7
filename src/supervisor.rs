//! Supervised background tasks with one shared cancellation signal.
//!
//! Every long-running unit of work (bus consumer loop, heartbeat monitor,
//! cleanup sweep, agent heartbeat publishers, workflow state processing) is
//! spawned through a [`TaskSupervisor`]. Shutdown flips a `watch` flag, waits
//! for tasks to drain up to a grace period, then aborts whatever is left.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shutdown flag receiver handed to supervised loops.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Resolve once `signal` reports shutdown (or its sender is gone).
pub async fn cancelled(signal: &mut ShutdownSignal) {
    let _ = signal.wait_for(|stop| *stop).await;
}

struct Supervised {
    name: String,
    handle: JoinHandle<()>,
}

/// Owner of a group of background tasks.
pub struct TaskSupervisor {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<Supervised>>,
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("shutting_down", &self.is_shutting_down())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<Supervised>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A fresh receiver of the shutdown flag.
    pub fn signal(&self) -> ShutdownSignal {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn `future` under supervision. Finished tasks are pruned on each call.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "Spawning supervised task");
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(Supervised { name, handle });
    }

    /// Number of tasks that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        self.tasks()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Signal shutdown, wait up to `grace` for tasks to finish, abort the rest.
    ///
    /// Tasks spawned while draining (a loop handing off its last piece of
    /// work) are collected too, under the same deadline. Returns the number
    /// of tasks that had to be aborted. The flag is cleared afterwards so the
    /// supervisor can be reused.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.shutdown_tx.send_replace(true);
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;

        loop {
            let batch: Vec<Supervised> = std::mem::take(&mut *self.tasks());
            if batch.is_empty() {
                break;
            }
            for Supervised { name, mut handle } in batch {
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(Ok(())) => debug!(task = %name, "Task drained"),
                    Ok(Err(e)) if e.is_panic() => {
                        warn!(task = %name, "Task panicked during shutdown")
                    }
                    Ok(Err(_)) => {}
                    Err(_) => {
                        handle.abort();
                        aborted += 1;
                        warn!(task = %name, "Task did not drain in time, aborted");
                    }
                }
            }
        }

        self.shutdown_tx.send_replace(false);
        if aborted > 0 {
            info!(aborted, "Supervisor shut down with aborted tasks");
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_loops_observe_shutdown() {
        let supervisor = TaskSupervisor::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let mut signal = supervisor.signal();
        let flag = stopped.clone();
        supervisor.spawn("loop", async move {
            cancelled(&mut signal).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(supervisor.active_tasks(), 1);

        let aborted = supervisor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(aborted, 0);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!supervisor.is_shutting_down());
        assert_eq!(supervisor.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_stuck_tasks_are_aborted() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let aborted = supervisor.shutdown(Duration::from_millis(50)).await;
        assert_eq!(aborted, 1);
    }

    #[tokio::test]
    async fn test_tasks_spawned_while_draining_are_collected() {
        let supervisor = Arc::new(TaskSupervisor::new());
        let mut signal = supervisor.signal();
        let handoff = supervisor.clone();
        supervisor.spawn("loop", async move {
            cancelled(&mut signal).await;
            handoff.spawn("last-job", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
        });

        let aborted = supervisor.shutdown(Duration::from_millis(100)).await;
        assert_eq!(aborted, 1);
        assert_eq!(supervisor.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_finished_tasks_are_pruned() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("quick", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(supervisor.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_signal_taken_after_shutdown_sees_reset_flag() {
        let supervisor = TaskSupervisor::new();
        supervisor.shutdown(Duration::from_millis(10)).await;
        let signal = supervisor.signal();
        assert!(!*signal.borrow());
    }
}
