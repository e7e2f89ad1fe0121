//! The worker pool: dispatch, backpressure and pool-wide lifecycle.

mod entry;

pub use entry::PoolEntry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::task::OfficeTask;

/// Entries plus the idle-token queue; exists only while running.
struct PoolInner {
    entries: Vec<Arc<PoolEntry>>,
    idle_rx: Mutex<mpsc::Receiver<usize>>,
}

/// A pool of supervised worker processes executing [`OfficeTask`]s.
///
/// Dispatch hands each task to an available entry; when none is
/// available the caller waits, up to the queue-wait budget, for one to
/// free up. Entries push an idle token when they become available; a
/// token whose entry went unavailable in the meantime (crash, restart)
/// is simply discarded.
pub struct WorkerPool {
    config: PoolConfig,
    inner: RwLock<Option<PoolInner>>,
    running: AtomicBool,
}

impl WorkerPool {
    /// Creates a stopped pool.
    ///
    /// # Errors
    ///
    /// `PoolError::InvalidConfig` if the configuration is rejected.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            config,
            inner: RwLock::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Whether the pool is started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of configured workers.
    pub fn size(&self) -> usize {
        self.config.ports.len() + self.config.pipe_names.len()
    }

    /// The pool's entries, in dispatch order; empty when stopped.
    ///
    /// Exposed for diagnostics (per-worker task counts, availability).
    pub async fn entries(&self) -> Vec<Arc<PoolEntry>> {
        match self.inner.read().await.as_ref() {
            Some(inner) => inner.entries.clone(),
            None => Vec::new(),
        }
    }

    /// Starts every worker. Atomic: if any worker fails to start, the
    /// already-started ones are stopped and the error is returned.
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut inner = self.inner.write().await;
        if inner.is_some() {
            return Err(PoolError::AlreadyRunning);
        }

        let addresses = self.config.addresses();
        // Crash recovery can briefly leave a stale token next to a
        // fresh one for the same entry, so give the queue slack.
        let (idle_tx, idle_rx) = mpsc::channel(addresses.len() * 2);

        let mut entries = Vec::with_capacity(addresses.len());
        for (index, address) in addresses.into_iter().enumerate() {
            entries.push(PoolEntry::new(address, &self.config, index, idle_tx.clone()));
        }

        for (index, entry) in entries.iter().enumerate() {
            if let Err(err) = entry.start().await {
                error!(
                    worker = index,
                    error = %err,
                    "Worker failed to start; aborting pool startup"
                );
                for started in &entries[..index] {
                    if let Err(stop_err) = started.stop().await {
                        warn!(
                            worker = started.index(),
                            error = %stop_err,
                            "Failed to stop worker during startup rollback"
                        );
                    }
                }
                return Err(err);
            }
        }

        *inner = Some(PoolInner {
            entries,
            idle_rx: Mutex::new(idle_rx),
        });
        self.running.store(true, Ordering::SeqCst);
        info!(workers = self.size(), "Office worker pool started");
        Ok(())
    }

    /// Stops every worker. Idempotent; individual stop failures are
    /// logged and do not abort the rest of the shutdown.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut inner = self.inner.write().await;
        let Some(pool) = inner.take() else {
            return;
        };

        for entry in &pool.entries {
            if let Err(err) = entry.stop().await {
                warn!(
                    worker = entry.index(),
                    error = %err,
                    "Failed to stop worker cleanly"
                );
            }
        }
        info!("Office worker pool stopped");
    }

    /// Executes a task on the first worker that becomes available.
    ///
    /// Waits up to the queue-wait budget for an available worker
    /// (`QueueTimeout` on elapse; no worker is affected), then returns
    /// the task's own outcome via [`PoolEntry::submit`]. The queue-wait
    /// and task-execution budgets are independent.
    pub async fn execute(&self, task: &dyn OfficeTask) -> Result<(), PoolError> {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }
        let inner = self.inner.read().await;
        let Some(pool) = inner.as_ref() else {
            return Err(PoolError::NotRunning);
        };

        let deadline = tokio::time::Instant::now() + self.config.task_queue_timeout;
        let entry = loop {
            let mut idle_rx = pool.idle_rx.lock().await;
            match tokio::time::timeout_at(deadline, idle_rx.recv()).await {
                Err(_) => {
                    return Err(PoolError::QueueTimeout {
                        timeout: self.config.task_queue_timeout,
                    })
                }
                Ok(None) => return Err(PoolError::Stopped),
                Ok(Some(index)) => {
                    let candidate = Arc::clone(&pool.entries[index]);
                    if !candidate.is_available() {
                        // Stale token from before a crash or restart.
                        debug!(worker = index, "Discarding stale idle token");
                        continue;
                    }
                    break candidate;
                }
            }
        };
        drop(inner);

        entry.submit(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::bridge::Connection;
    use crate::error::TaskError;

    struct NoopTask;

    #[async_trait]
    impl OfficeTask for NoopTask {
        async fn execute(&self, _connection: &Connection) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = WorkerPool::new(PoolConfig::new([]));
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_execute_requires_running_pool() {
        let pool = WorkerPool::new(PoolConfig::default()).expect("pool");
        let err = pool.execute(&NoopTask).await.expect_err("must fail");
        assert!(matches!(err, PoolError::NotRunning));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_never_started() {
        let pool = WorkerPool::new(PoolConfig::default()).expect("pool");
        pool.stop().await;
        pool.stop().await;
        assert!(!pool.is_running());
        assert!(pool.entries().await.is_empty());
    }
}
