//! RPC bridge to worker processes.
//!
//! The bridge owns the addressing scheme and the connection state
//! machine. Payloads are opaque; the engine defines the protocol.

mod address;
mod connection;

pub use address::WorkerAddress;
pub use connection::{Connection, ConnectionEvent, ConnectionState};
