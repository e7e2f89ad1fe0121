//! Engine process management: launch, liveness polling, termination.

mod office_process;
mod retry;

pub use office_process::OfficeProcess;
pub(crate) use retry::RetrySchedule;
