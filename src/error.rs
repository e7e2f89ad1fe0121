//! Error types for officepool operations.
//!
//! Defines error types for the major subsystems:
//! - Engine process launch, liveness polling and termination
//! - Bridge connection establishment and teardown
//! - Task execution (opaque, reported by the task itself)
//! - Pool-level dispatch and lifecycle

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while managing the engine process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The engine binary could not be spawned.
    #[error("Failed to launch engine process '{command}': {source}")]
    LaunchFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A liveness/exit poll did not settle within its retry budget.
    #[error("Process still running after {timeout:?}")]
    RetryTimeout { timeout: Duration },

    /// The process survived both the graceful and the forced kill signal.
    #[error("Process could not be terminated: {0}")]
    TerminationFailed(String),

    /// A start was requested while the previous process is still alive.
    #[error("Engine process is already running")]
    AlreadyRunning,

    /// Another engine process is already accepting on the configured
    /// address and the kill-existing policy is disabled.
    #[error("An existing engine process (pid {pid}) is already accepting on this address")]
    ExistingProcess { pid: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur on the bridge connection to a worker.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The worker is not (yet) listening at its address. Callers apply
    /// retry policy to this variant only.
    #[error("Could not reach worker at {address}: {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation requires an established connection.
    #[error("Not connected to a worker")]
    NotConnected,

    /// The peer vanished while a request was in flight.
    #[error("Connection lost while a request was in flight")]
    Disconnected,

    /// The single request slot of the connection is taken.
    #[error("A request is already in flight on this connection")]
    RequestInProgress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque failure reported by a task.
///
/// The pool never interprets the content of a task, so all it can carry
/// outward is a message and an optional source error. A connection that
/// dies under a running task converts into a `TaskError` so the one
/// in-flight caller sees a task failure while the pool recovers.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TaskError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TaskError {
    /// Creates a task error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a task error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns the failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ConnectError> for TaskError {
    fn from(err: ConnectError) -> Self {
        Self::with_source("Connection failed during task execution", err)
    }
}

/// Errors surfaced by the worker pool.
///
/// `WorkerPool::execute` is the sole public surface for all of these.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker could not be brought up: the launch failed, or the
    /// connect retry budget was exhausted.
    #[error("Could not start worker at '{address}'")]
    Startup {
        address: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The task itself failed; never retried by the pool.
    #[error("Task failed: {0}")]
    Task(#[from] TaskError),

    /// The task did not complete within the execution budget. The
    /// worker has been force-restarted; the task is not retried.
    #[error("Task did not complete within {timeout:?}")]
    TaskTimeout { timeout: Duration },

    /// No worker became available within the queue-wait budget. No
    /// worker is affected.
    #[error("No worker available after {timeout:?}")]
    QueueTimeout { timeout: Duration },

    /// The pool (or entry) has not been started.
    #[error("Pool is not running")]
    NotRunning,

    /// The pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// A task is already executing on this worker.
    #[error("A task is already in progress on this worker")]
    TaskInProgress,

    /// The supervisor behind this handle has shut down.
    #[error("Worker supervisor has been stopped")]
    Stopped,

    /// The pool configuration is invalid.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_error_display() {
        let err = ProcessError::RetryTimeout {
            timeout: Duration::from_secs(120),
        };
        assert!(err.to_string().contains("120"));

        let err = ProcessError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_connect_error_display() {
        let err = ConnectError::ConnectFailed {
            address: "socket,host=127.0.0.1,port=2002".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.to_string().contains("port=2002"));

        let err = ConnectError::NotConnected;
        assert!(err.to_string().contains("Not connected"));
    }

    #[test]
    fn test_task_error_carries_source() {
        let err = TaskError::from(ConnectError::Disconnected);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.message().contains("Connection failed"));

        let err = TaskError::new("document is password protected");
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::QueueTimeout {
            timeout: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("No worker available"));

        let err = PoolError::TaskTimeout {
            timeout: Duration::from_millis(100),
        };
        assert!(err.to_string().contains("100"));

        let err = PoolError::Startup {
            address: "socket,host=127.0.0.1,port=2002".to_string(),
            source: Box::new(ConnectError::NotConnected),
        };
        assert!(err.to_string().contains("Could not start worker"));
    }
}
