//! officepool: process pool manager for external office rendering engines.
//!
//! An office rendering engine is an external, crash-prone,
//! single-threaded process. This crate keeps a pool of them useful:
//! it launches each worker with a private profile directory, bridges
//! to it over a local RPC channel, dispatches conversion tasks with
//! backpressure, and restarts workers on crashes, hangs and
//! task-count limits.
//!
//! # Example
//!
//! ```ignore
//! use officepool::{PoolConfig, WorkerPool};
//!
//! let pool = WorkerPool::new(PoolConfig::new([2002, 2003]))?;
//! pool.start().await?;
//! pool.execute(&my_conversion_task).await?;
//! pool.stop().await;
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod pool;
pub mod process;
pub mod supervisor;
pub mod task;

pub use bridge::{Connection, ConnectionEvent, ConnectionState, WorkerAddress};
pub use config::PoolConfig;
pub use error::{ConnectError, PoolError, ProcessError, TaskError};
pub use pool::{PoolEntry, WorkerPool};
pub use process::OfficeProcess;
pub use supervisor::{SupervisorState, WorkerSupervisor};
pub use task::OfficeTask;
