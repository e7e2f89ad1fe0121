//! One worker's execution slot, task counter and recovery policy.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{ConnectionEvent, WorkerAddress};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::supervisor::WorkerSupervisor;
use crate::task::OfficeTask;

/// Pairs one [`WorkerSupervisor`] with a single-task execution slot.
///
/// The entry enforces the per-worker policies: at most one in-flight
/// task, a restart after `max_tasks_per_worker` tasks, the per-task
/// execution timeout, and crash recovery driven by connection events.
pub struct PoolEntry {
    supervisor: WorkerSupervisor,
    /// Tasks completed by the current worker process. Resets to 0 on
    /// every reconnect; the task that triggers a max-tasks restart
    /// counts as task 1 of the new generation.
    tasks_processed: AtomicU32,
    /// True iff connected with no task in flight. The pool never
    /// dispatches to an entry whose flag is false.
    available: AtomicBool,
    /// Set before a self-initiated teardown so the resulting
    /// disconnection is not mistaken for a crash.
    disconnect_expected: AtomicBool,
    started: AtomicBool,
    /// Execution slot; try-locked so concurrent misuse errors instead
    /// of queueing.
    slot: Mutex<()>,
    max_tasks_per_worker: u32,
    task_execution_timeout: Duration,
    index: usize,
    idle_tx: mpsc::Sender<usize>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl PoolEntry {
    /// Creates the entry and spawns its control loop. The worker is
    /// not launched until [`start`](Self::start).
    pub(crate) fn new(
        address: WorkerAddress,
        config: &PoolConfig,
        index: usize,
        idle_tx: mpsc::Sender<usize>,
    ) -> Arc<Self> {
        let supervisor = WorkerSupervisor::new(address, config);
        let events = supervisor.connection().subscribe();

        let entry = Arc::new(Self {
            supervisor,
            tasks_processed: AtomicU32::new(0),
            available: AtomicBool::new(false),
            disconnect_expected: AtomicBool::new(false),
            started: AtomicBool::new(false),
            slot: Mutex::new(()),
            max_tasks_per_worker: config.max_tasks_per_worker,
            task_execution_timeout: config.task_execution_timeout,
            index,
            idle_tx,
            control: Mutex::new(None),
        });

        let handle = tokio::spawn(control_loop(Arc::downgrade(&entry), events));
        if let Ok(mut control) = entry.control.try_lock() {
            *control = Some(handle);
        }
        entry
    }

    /// Worker index within the pool, fixed for the entry's lifetime.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the entry can accept a task right now.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Tasks completed by the current worker process.
    pub fn task_count(&self) -> u32 {
        self.tasks_processed.load(Ordering::SeqCst)
    }

    /// Starts the worker and waits for its connection.
    pub async fn start(&self) -> Result<(), PoolError> {
        self.supervisor.start().await?;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stops the worker; the disconnection this causes is expected.
    pub async fn stop(&self) -> Result<(), PoolError> {
        self.started.store(false, Ordering::SeqCst);
        self.available.store(false, Ordering::SeqCst);
        self.disconnect_expected.store(true, Ordering::SeqCst);
        let result = self.supervisor.stop().await;
        if let Some(handle) = self.control.lock().await.take() {
            handle.abort();
        }
        result
    }

    /// Executes one task on this worker.
    ///
    /// Restarts the worker first when the max-tasks limit is reached.
    /// Enforces the execution timeout: on elapse the worker is
    /// force-restarted, the caller gets `TaskTimeout`, and whatever the
    /// task would still produce is irrelevant.
    pub async fn submit(&self, task: &dyn OfficeTask) -> Result<(), PoolError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }
        let _slot = self.slot.try_lock().map_err(|_| PoolError::TaskInProgress)?;

        if self.max_tasks_per_worker > 0
            && self.tasks_processed.load(Ordering::SeqCst) >= self.max_tasks_per_worker
        {
            info!(
                worker = self.index,
                max_tasks = self.max_tasks_per_worker,
                "Reached max tasks per worker; restarting before next task"
            );
            self.available.store(false, Ordering::SeqCst);
            self.disconnect_expected.store(true, Ordering::SeqCst);
            self.supervisor.restart().await?;
        }

        self.available.store(false, Ordering::SeqCst);
        let connection = self.supervisor.connection();

        match tokio::time::timeout(self.task_execution_timeout, task.execute(connection)).await {
            Ok(outcome) => {
                self.tasks_processed.fetch_add(1, Ordering::SeqCst);
                if connection.is_connected() {
                    self.mark_available();
                }
                outcome.map_err(PoolError::Task)
            }
            Err(_) => {
                warn!(
                    worker = self.index,
                    timeout = ?self.task_execution_timeout,
                    "Task did not complete within timeout; restarting worker"
                );
                self.supervisor.restart_due_to_timeout();
                Err(PoolError::TaskTimeout {
                    timeout: self.task_execution_timeout,
                })
            }
        }
    }

    /// Marks the entry available and hands the pool an idle token,
    /// exactly once per false-to-true transition.
    fn mark_available(&self) {
        if self
            .available
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            && self.idle_tx.try_send(self.index).is_err()
        {
            warn!(worker = self.index, "Could not queue idle token");
        }
    }

    fn on_connected(&self) {
        self.tasks_processed.store(0, Ordering::SeqCst);
        // A reconnect can land while a task holds the slot (the one
        // that triggered a max-tasks restart). That task re-marks the
        // entry on completion; marking here would offer a busy entry
        // to the pool.
        match self.slot.try_lock() {
            Ok(_slot) => self.mark_available(),
            Err(_) => debug!(
                worker = self.index,
                "Reconnected with a task in flight; deferring availability"
            ),
        }
    }

    fn on_disconnected(&self) {
        self.available.store(false, Ordering::SeqCst);
        if !self.disconnect_expected.swap(false, Ordering::SeqCst) {
            warn!(
                worker = self.index,
                "Connection lost unexpectedly; attempting restart"
            );
            self.supervisor.restart_due_to_lost_connection();
        }
    }
}

/// Consumes connection events for one entry.
///
/// Holding only a weak reference lets the entry (and its supervisor)
/// drop even if an event never arrives again.
async fn control_loop(
    entry: Weak<PoolEntry>,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(entry) = entry.upgrade() else { break };
                debug!(worker = entry.index, ?event, "Connection event");
                match event {
                    ConnectionEvent::Connected => entry.on_connected(),
                    ConnectionEvent::Disconnected => entry.on_disconnected(),
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Connection event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
