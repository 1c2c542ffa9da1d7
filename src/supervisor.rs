//! Supervised tasks.
//!
//! Every long-lived unit of work (mesh loops, broker event pump, OTA workers)
//! is spawned through a [`Supervisor`], which records its lifecycle so it can
//! be observed, awaited and aborted instead of vanishing on completion.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Spawned,
    Running,
    Completed,
    Failed(String),
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed(_) | TaskStatus::Aborted
        )
    }
}

struct TaskEntry {
    id: u64,
    name: String,
    status: watch::Receiver<TaskStatus>,
    abort: AbortHandle,
}

/// Cloneable registry of spawned tasks.
#[derive(Clone, Default)]
pub struct Supervisor {
    tasks: Arc<Mutex<Vec<TaskEntry>>>,
    next_id: Arc<AtomicU64>,
}

/// Handle to one supervised task.
pub struct TaskHandle {
    id: u64,
    name: String,
    status: watch::Receiver<TaskStatus>,
    abort: AbortHandle,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `future` on the tokio runtime under `name`.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> TaskHandle
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (status_tx, status_rx) = watch::channel(TaskStatus::Spawned);
        let status_tx = Arc::new(status_tx);

        let task_status = Arc::clone(&status_tx);
        let task_name = name.clone();
        let join = tokio::spawn(async move {
            task_status.send_replace(TaskStatus::Running);
            match future.await {
                Ok(()) => {
                    debug!("supervisor: {} completed", task_name);
                    task_status.send_replace(TaskStatus::Completed);
                }
                Err(e) => {
                    error!("supervisor: {} failed: {:#}", task_name, e);
                    task_status.send_replace(TaskStatus::Failed(format!("{e:#}")));
                }
            }
        });
        let abort = join.abort_handle();

        // Panics and aborts never reach the status updates above
        let watcher_name = name.clone();
        tokio::spawn(async move {
            if let Err(e) = join.await {
                if e.is_panic() {
                    error!("supervisor: {} panicked", watcher_name);
                    status_tx.send_replace(TaskStatus::Failed("panicked".to_string()));
                } else {
                    debug!("supervisor: {} aborted", watcher_name);
                    status_tx.send_replace(TaskStatus::Aborted);
                }
            }
        });

        let mut tasks = self.tasks();
        tasks.retain(|task| !task.status.borrow().is_terminal());
        tasks.push(TaskEntry {
            id,
            name: name.clone(),
            status: status_rx.clone(),
            abort: abort.clone(),
        });

        TaskHandle {
            id,
            name,
            status: status_rx,
            abort,
        }
    }

    /// Abort every unfinished task whose name starts with `prefix`.
    /// Returns how many were aborted.
    pub fn abort_matching(&self, prefix: &str) -> usize {
        let tasks = self.tasks();
        let mut aborted = 0;
        for task in tasks.iter() {
            if task.name.starts_with(prefix) && !task.status.borrow().is_terminal() {
                debug!("supervisor: aborting {} (#{})", task.name, task.id);
                task.abort.abort();
                aborted += 1;
            }
        }
        aborted
    }

    pub fn abort_all(&self) -> usize {
        self.abort_matching("")
    }

    /// Number of unfinished tasks whose name starts with `prefix`.
    pub fn running(&self, prefix: &str) -> usize {
        self.tasks()
            .iter()
            .filter(|task| task.name.starts_with(prefix) && !task.status.borrow().is_terminal())
            .count()
    }

    /// Name and status of every tracked task.
    pub fn snapshot(&self) -> Vec<(String, TaskStatus)> {
        self.tasks()
            .iter()
            .map(|task| (task.name.clone(), task.status.borrow().clone()))
            .collect()
    }
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.status.borrow().clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Wait for the task to reach a terminal status.
    pub async fn join(&mut self) -> TaskStatus {
        let reached = self
            .status
            .wait_for(TaskStatus::is_terminal)
            .await
            .map(|status| status.clone());
        match reached {
            Ok(status) => status,
            Err(_) => self.status.borrow().clone(),
        }
    }
}
