//! Bridge connection to a running worker process.
//!
//! The connection is a small state machine (`Disconnected`,
//! `Connecting`, `Connected`) layered over a local stream transport.
//! State transitions to and from `Connected` are published on a
//! broadcast channel so the owning pool entry can react to crashes
//! without callback re-entrancy.
//!
//! The wire format is opaque to this crate: requests and responses are
//! length-prefixed byte frames whose payloads belong entirely to the
//! engine. A zero-length frame asks the engine to exit. The engine is
//! single-threaded, so the connection allows one in-flight request.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::ConnectError;

use super::address::WorkerAddress;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notification emitted on transitions to and from `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

trait BridgeStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> BridgeStream for T {}

/// State shared with the background reader task.
struct Shared {
    address: WorkerAddress,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        // send_replace stores even when nobody watches the channel.
        self.state_tx.send_replace(state);
    }

    fn mark_connected(&self) {
        self.set_state(ConnectionState::Connected);
        let _ = self.event_tx.send(ConnectionEvent::Connected);
    }

    /// Flips to `Disconnected` and emits the event exactly once, no
    /// matter how many paths (reader EOF, explicit teardown) race here.
    fn mark_disconnected(&self) {
        let was_connected = self.state_tx.send_if_modified(|state| {
            let previous = *state;
            *state = ConnectionState::Disconnected;
            previous == ConnectionState::Connected
        });
        if was_connected {
            debug!(address = %self.address, "Disconnected from worker");
            let _ = self.event_tx.send(ConnectionEvent::Disconnected);
        }
    }
}

/// Live transport halves of an established connection.
struct Active {
    writer: WriteHalf<Box<dyn BridgeStream>>,
    response_rx: mpsc::Receiver<Vec<u8>>,
}

/// Bridge connection to one worker at a fixed address.
pub struct Connection {
    shared: Arc<Shared>,
    /// Request path; held across the write/await-response sequence so
    /// requests serialize naturally.
    inner: Mutex<Option<Active>>,
    /// Reader abort handle, kept outside `inner` so teardown never has
    /// to wait behind an in-flight request.
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Creates a disconnected connection for the given address.
    pub fn new(address: WorkerAddress) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                address,
                state_tx,
                event_tx,
            }),
            inner: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// The address this connection dials.
    pub fn address(&self) -> &WorkerAddress {
        &self.shared.address
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribes to connect/disconnect notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Attempts to reach a listening worker.
    ///
    /// A dial failure is reported as [`ConnectError::ConnectFailed`] so
    /// callers can retry it distinctly from other errors. Connecting
    /// while already connected is a no-op.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut inner = self.inner.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        // Drop any stale transport left over from a lost connection.
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        *inner = None;

        self.shared.set_state(ConnectionState::Connecting);
        debug!(address = %self.shared.address, "Connecting to worker");

        let stream = match dial(&self.shared.address).await {
            Ok(stream) => stream,
            Err(source) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(ConnectError::ConnectFailed {
                    address: self.shared.address.to_string(),
                    source,
                });
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (response_tx, response_rx) = mpsc::channel(1);
        let handle = tokio::spawn(read_loop(
            read_half,
            response_tx,
            Arc::clone(&self.shared),
        ));

        *inner = Some(Active {
            writer: write_half,
            response_rx,
        });
        *self.reader.lock().await = Some(handle);
        self.shared.mark_connected();
        debug!(address = %self.shared.address, "Connected to worker");
        Ok(())
    }

    /// Local teardown; idempotent, never touches the remote process.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        // An in-flight request may hold `inner`; it fails on its own
        // once the reader is gone, and the stale transport is replaced
        // on the next connect.
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(mut active) = inner.take() {
                let _ = active.writer.shutdown().await;
            }
        }
        self.shared.mark_disconnected();
    }

    /// Sends one opaque request frame and awaits the response frame.
    ///
    /// Requests serialize on the connection; the worker processes one
    /// at a time. A connection lost mid-request surfaces as
    /// [`ConnectError::Disconnected`].
    pub async fn request(&self, payload: &[u8]) -> Result<Vec<u8>, ConnectError> {
        let mut inner = self.inner.lock().await;
        let active = inner.as_mut().ok_or(ConnectError::NotConnected)?;
        if !self.is_connected() {
            return Err(ConnectError::NotConnected);
        }

        trace!(len = payload.len(), "Sending request frame");
        write_frame(&mut active.writer, payload)
            .await
            .map_err(|_| ConnectError::Disconnected)?;

        match active.response_rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(ConnectError::Disconnected),
        }
    }

    /// Asks the engine to exit gracefully (zero-length frame).
    ///
    /// Does not wait for the exit; callers follow up with process-level
    /// exit polling. Fails fast instead of queuing behind a busy
    /// request slot, since a busy worker cannot honor it anyway.
    pub async fn request_shutdown(&self) -> Result<(), ConnectError> {
        let mut inner = self
            .inner
            .try_lock()
            .map_err(|_| ConnectError::RequestInProgress)?;
        let active = inner.as_mut().ok_or(ConnectError::NotConnected)?;
        write_frame(&mut active.writer, &[])
            .await
            .map_err(|_| ConnectError::Disconnected)
    }
}

/// Dials the transport behind a worker address.
async fn dial(address: &WorkerAddress) -> std::io::Result<Box<dyn BridgeStream>> {
    match address {
        WorkerAddress::Socket { port } => {
            let stream = TcpStream::connect(("127.0.0.1", *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        WorkerAddress::Pipe { .. } => {
            #[cfg(target_family = "unix")]
            {
                let path = address
                    .pipe_path()
                    .ok_or_else(|| std::io::Error::other("pipe address without path"))?;
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream) as Box<dyn BridgeStream>)
            }
            #[cfg(not(target_family = "unix"))]
            {
                Err(std::io::Error::other(
                    "pipe addresses are only supported on unix platforms",
                ))
            }
        }
    }
}

/// Reads response frames until the peer goes away, then flips the
/// connection to `Disconnected`. This is what detects a worker crash
/// while the entry is idle.
async fn read_loop(
    mut reader: ReadHalf<Box<dyn BridgeStream>>,
    response_tx: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
) {
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        if reader.read_exact(&mut frame).await.is_err() {
            break;
        }
        if response_tx.send(frame).await.is_err() {
            // Connection was replaced under us.
            break;
        }
    }
    shared.mark_disconnected();
}

async fn write_frame(
    writer: &mut (impl AsyncWrite + Unpin),
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::net::TcpListener;

    async fn echo_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    async fn serve_one_echo(listener: &TcpListener) {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut len_buf = [0u8; 4];
        socket.read_exact(&mut len_buf).await.expect("read len");
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        socket.read_exact(&mut payload).await.expect("read payload");
        socket.write_all(&len_buf).await.expect("write len");
        socket.write_all(&payload).await.expect("write payload");
        socket.flush().await.expect("flush");
        // Keep the socket open until the client is done.
        let _ = socket.read(&mut len_buf).await;
    }

    #[tokio::test]
    async fn test_connect_refused_is_retryable_kind() {
        let (listener, port) = echo_server().await;
        drop(listener);

        let connection = Connection::new(WorkerAddress::socket(port));
        let err = connection.connect().await.expect_err("must fail");
        assert!(matches!(err, ConnectError::ConnectFailed { .. }));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_state_tracked_without_subscribers() {
        let (listener, port) = echo_server().await;

        // No subscribe() call anywhere: the state must still be
        // readable through is_connected().
        let connection = Connection::new(WorkerAddress::socket(port));
        let (socket, result) = tokio::join!(listener.accept(), connection.connect());
        result.expect("connect");
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(connection.is_connected());

        drop(socket.expect("accept"));
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (listener, port) = echo_server().await;
        let server = tokio::spawn(async move { serve_one_echo(&listener).await });

        let connection = Connection::new(WorkerAddress::socket(port));
        connection.connect().await.expect("connect");
        assert!(connection.is_connected());

        let response = connection.request(b"convert doc.odt").await.expect("request");
        assert_eq!(response, b"convert doc.odt");

        connection.disconnect().await;
        assert!(!connection.is_connected());
        server.await.expect("server");
    }

    #[tokio::test]
    async fn test_peer_close_emits_disconnected_event() {
        let (listener, port) = echo_server().await;

        let connection = Connection::new(WorkerAddress::socket(port));
        let mut events = connection.subscribe();

        let (socket, _) = tokio::join!(listener.accept(), connection.connect());
        assert_eq!(events.recv().await.expect("event"), ConnectionEvent::Connected);

        drop(socket.expect("accept"));
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within deadline")
            .expect("event");
        assert_eq!(event, ConnectionEvent::Disconnected);
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (listener, port) = echo_server().await;

        let connection = Connection::new(WorkerAddress::socket(port));
        let mut events = connection.subscribe();
        let (_socket, _) = tokio::join!(listener.accept(), connection.connect());
        assert_eq!(events.recv().await.expect("event"), ConnectionEvent::Connected);

        connection.disconnect().await;
        connection.disconnect().await;

        assert_eq!(
            events.recv().await.expect("event"),
            ConnectionEvent::Disconnected
        );
        // No second Disconnected queued.
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_request_without_connection() {
        let connection = Connection::new(WorkerAddress::socket(1));
        let err = connection.request(b"x").await.expect_err("must fail");
        assert!(matches!(err, ConnectError::NotConnected));
    }
}
