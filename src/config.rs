//! Pool configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::WorkerAddress;
use crate::error::PoolError;

/// Default maximum number of tasks a worker executes before restart.
pub const DEFAULT_MAX_TASKS_PER_WORKER: u32 = 200;
/// Default per-task execution timeout.
pub const DEFAULT_TASK_EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);
/// Default wait budget for an available worker.
pub const DEFAULT_TASK_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default interval between process/connect poll attempts.
pub const DEFAULT_PROCESS_RETRY_INTERVAL: Duration = Duration::from_millis(250);
/// Default budget for process start/exit polling.
pub const DEFAULT_PROCESS_RETRY_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for a [`WorkerPool`](crate::pool::WorkerPool).
///
/// One worker is created per socket port, then one per pipe name, in
/// that order.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Loopback ports, one worker each.
    pub ports: Vec<u16>,
    /// Named pipes, one worker each, appended after the socket workers.
    pub pipe_names: Vec<String>,
    /// Path to the rendering-engine binary.
    pub engine_binary: PathBuf,
    /// Directory under which per-instance profile dirs are created.
    pub working_dir: PathBuf,
    /// Tasks a worker may execute before it is restarted; 0 disables
    /// the limit.
    pub max_tasks_per_worker: u32,
    /// Budget for one task execution; on elapse the worker is
    /// force-restarted and the caller gets a timeout error.
    pub task_execution_timeout: Duration,
    /// How long `execute` waits for an available worker.
    pub task_queue_timeout: Duration,
    /// Whether a stray engine process found accepting on a worker's
    /// address is killed before launch; when false the start fails
    /// instead.
    pub kill_existing_process: bool,
    /// Interval between liveness/connect poll attempts.
    pub process_retry_interval: Duration,
    /// Budget for process startup, connect retries and exit polling.
    pub process_retry_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ports: vec![2002],
            pipe_names: Vec::new(),
            engine_binary: PathBuf::from("soffice"),
            working_dir: std::env::temp_dir(),
            max_tasks_per_worker: DEFAULT_MAX_TASKS_PER_WORKER,
            task_execution_timeout: DEFAULT_TASK_EXECUTION_TIMEOUT,
            task_queue_timeout: DEFAULT_TASK_QUEUE_TIMEOUT,
            kill_existing_process: true,
            process_retry_interval: DEFAULT_PROCESS_RETRY_INTERVAL,
            process_retry_timeout: DEFAULT_PROCESS_RETRY_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with one worker per given port.
    pub fn new(ports: impl Into<Vec<u16>>) -> Self {
        Self {
            ports: ports.into(),
            ..Default::default()
        }
    }

    /// Sets the pipe names.
    pub fn with_pipe_names(mut self, names: impl Into<Vec<String>>) -> Self {
        self.pipe_names = names.into();
        self
    }

    /// Sets the engine binary path.
    pub fn with_engine_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.engine_binary = binary.into();
        self
    }

    /// Sets the working directory for profile dirs.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Sets the max-tasks-per-worker limit (0 = unlimited).
    pub fn with_max_tasks_per_worker(mut self, max: u32) -> Self {
        self.max_tasks_per_worker = max;
        self
    }

    /// Sets the per-task execution timeout.
    pub fn with_task_execution_timeout(mut self, timeout: Duration) -> Self {
        self.task_execution_timeout = timeout;
        self
    }

    /// Sets the queue-wait timeout.
    pub fn with_task_queue_timeout(mut self, timeout: Duration) -> Self {
        self.task_queue_timeout = timeout;
        self
    }

    /// Sets the policy for a stray engine process already accepting on
    /// a worker's address: kill it (true) or fail the start (false).
    pub fn with_kill_existing_process(mut self, kill: bool) -> Self {
        self.kill_existing_process = kill;
        self
    }

    /// Sets the process poll interval.
    pub fn with_process_retry_interval(mut self, interval: Duration) -> Self {
        self.process_retry_interval = interval;
        self
    }

    /// Sets the process poll budget.
    pub fn with_process_retry_timeout(mut self, timeout: Duration) -> Self {
        self.process_retry_timeout = timeout;
        self
    }

    /// The worker addresses this configuration describes, in dispatch
    /// order.
    pub fn addresses(&self) -> Vec<WorkerAddress> {
        self.ports
            .iter()
            .map(|port| WorkerAddress::socket(*port))
            .chain(self.pipe_names.iter().map(|name| WorkerAddress::pipe(name.as_str())))
            .collect()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.ports.is_empty() && self.pipe_names.is_empty() {
            return Err(PoolError::InvalidConfig(
                "at least one port or pipe name is required".to_string(),
            ));
        }
        if self.process_retry_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "process retry interval must be non-zero".to_string(),
            ));
        }
        if self.process_retry_interval > self.process_retry_timeout {
            return Err(PoolError::InvalidConfig(
                "process retry interval exceeds the retry timeout".to_string(),
            ));
        }
        Ok(())
    }
}
