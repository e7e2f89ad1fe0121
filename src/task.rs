//! The task capability consumed by the pool.

use async_trait::async_trait;

use crate::bridge::Connection;
use crate::error::TaskError;

/// An opaque, caller-supplied unit of work executed against an
/// established worker connection.
///
/// The pool never inspects a task's content; it only drives the
/// execution slot, the timeout budget and the restart policy around
/// it. Conversion logic (load, filter, store) composes behind this one
/// trait rather than through subclassing.
#[async_trait]
pub trait OfficeTask: Send + Sync {
    /// Executes the task against the worker behind `connection`.
    ///
    /// A failure here is the task's own outcome; the pool surfaces it
    /// unmodified and never retries it.
    async fn execute(&self, connection: &Connection) -> Result<(), TaskError>;
}
