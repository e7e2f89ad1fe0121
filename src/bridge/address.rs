//! Connection descriptors for worker processes.
//!
//! A worker accepts its bridge connection either on a loopback TCP port
//! or on a named local channel. The address is rendered in two forms:
//! the `--accept=` argument handed to the engine on its command line,
//! and the dial target used by [`Connection`](super::Connection).

use std::fmt;
use std::path::PathBuf;

/// Immutable connection descriptor for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerAddress {
    /// Loopback TCP socket on the given port.
    Socket { port: u16 },
    /// Named local channel (a unix socket under the system temp dir).
    Pipe { name: String },
}

impl WorkerAddress {
    /// Creates a loopback socket address.
    pub fn socket(port: u16) -> Self {
        Self::Socket { port }
    }

    /// Creates a named pipe address.
    pub fn pipe(name: impl Into<String>) -> Self {
        Self::Pipe { name: name.into() }
    }

    /// Renders the accept string embedded in the engine command line.
    pub fn accept_string(&self) -> String {
        match self {
            Self::Socket { port } => {
                format!("socket,host=127.0.0.1,port={},tcpNoDelay=1;urp", port)
            }
            Self::Pipe { name } => format!("pipe,name={};urp", name),
        }
    }

    /// Filesystem path backing a pipe address.
    ///
    /// Only meaningful for `Pipe`; sockets dial `127.0.0.1:<port>`.
    pub fn pipe_path(&self) -> Option<PathBuf> {
        match self {
            Self::Socket { .. } => None,
            Self::Pipe { name } => Some(std::env::temp_dir().join(format!("officepool-{}.sock", name))),
        }
    }

    /// A slug usable as a directory-name component, uniquely derived
    /// from the address. Used for per-instance profile directories.
    pub fn profile_slug(&self) -> String {
        match self {
            Self::Socket { port } => format!("socket_port-{}", port),
            Self::Pipe { name } => format!("pipe_name-{}", name),
        }
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket { port } => write!(f, "socket,host=127.0.0.1,port={}", port),
            Self::Pipe { name } => write!(f, "pipe,name={}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_accept_string() {
        let address = WorkerAddress::socket(2002);
        assert_eq!(
            address.accept_string(),
            "socket,host=127.0.0.1,port=2002,tcpNoDelay=1;urp"
        );
        assert_eq!(address.to_string(), "socket,host=127.0.0.1,port=2002");
        assert!(address.pipe_path().is_none());
    }

    #[test]
    fn test_pipe_accept_string() {
        let address = WorkerAddress::pipe("office1");
        assert_eq!(address.accept_string(), "pipe,name=office1;urp");
        assert_eq!(address.to_string(), "pipe,name=office1");

        let path = address.pipe_path().expect("pipe address has a path");
        assert!(path.to_string_lossy().contains("officepool-office1.sock"));
    }

    #[test]
    fn test_profile_slug_is_unique_per_address() {
        assert_ne!(
            WorkerAddress::socket(2002).profile_slug(),
            WorkerAddress::socket(2003).profile_slug()
        );
        assert_ne!(
            WorkerAddress::socket(2002).profile_slug(),
            WorkerAddress::pipe("2002").profile_slug()
        );
    }
}
